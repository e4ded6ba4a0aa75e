use shell_quote::{Bash, Quote};

/// Quote one word for bash.
pub(crate) fn quote(word: &str) -> String {
    <Bash as Quote<String>>::quote(word)
}

/// A single program occupying one MPI rank.
///
/// `Program` is the leaf of the [`RankSpec`] tree. Programs marked serial
/// are non-MPI executables that must be wrapped in `mpiserial` (or run
/// directly) by the backend.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub(crate) executable: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) threads: Option<usize>,
    pub(crate) local_opts: Vec<String>,
    pub(crate) ranks_per_node: Option<usize>,
    pub(crate) turbo_mode: bool,
    pub(crate) serial: bool,
}

impl Program {
    /// Construct a parallel (MPI) program.
    pub fn new(executable: impl Into<String>) -> Self {
        Program {
            executable: executable.into(),
            ..Program::default()
        }
    }

    /// Construct a serial (non-MPI) program.
    pub fn serial(executable: impl Into<String>) -> Self {
        Program {
            executable: executable.into(),
            serial: true,
            ..Program::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a per-rank environment assignment.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Set the OpenMP thread count for this rank.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Attach a backend-specific launcher option to this rank.
    #[must_use]
    pub fn local_opt(mut self, opt: impl Into<String>) -> Self {
        self.local_opts.push(opt.into());
        self
    }

    /// Limit the number of ranks placed on each node.
    #[must_use]
    pub fn ranks_per_node(mut self, ranks: usize) -> Self {
        self.ranks_per_node = Some(ranks);
        self
    }

    /// Request the highest available CPU frequency on backends that
    /// support it.
    #[must_use]
    pub fn turbo(mut self, turbo_mode: bool) -> Self {
        self.turbo_mode = turbo_mode;
        self
    }

    pub fn is_serial(&self) -> bool {
        self.serial
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn thread_count(&self) -> Option<usize> {
        self.threads
    }

    pub fn wants_turbo(&self) -> bool {
        self.turbo_mode
    }

    pub fn node_ranks(&self) -> Option<usize> {
        self.ranks_per_node
    }

    pub fn launcher_opts(&self) -> &[String] {
        &self.local_opts
    }

    /// The argv tokens for this rank.
    ///
    /// Per-rank environment assignments are expressed with a
    /// `/usr/bin/env` prefix so that MPMD launchers apply them to one
    /// group only.
    pub(crate) fn arglist(&self) -> Vec<String> {
        let mut result = Vec::with_capacity(self.args.len() + self.env.len() + 2);
        if !self.env.is_empty() {
            result.push("/usr/bin/env".to_string());
            for (name, value) in &self.env {
                result.push(format!("{name}={value}"));
            }
        }
        result.push(self.executable.clone());
        result.extend(self.args.iter().cloned());
        result
    }

    /// This rank's command as a single bash line.
    pub(crate) fn shell_line(&self) -> String {
        let mut result = String::new();
        for (name, value) in &self.env {
            result.push_str(name);
            result.push('=');
            result.push_str(&quote(value));
            result.push(' ');
        }
        result.push_str(&quote(&self.executable));
        for arg in &self.args {
            result.push(' ');
            result.push_str(&quote(arg));
        }
        result
    }
}

/// A per-rank setting summarized over a whole tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Setting<T> {
    /// No rank sets the value.
    Unset,
    /// Every rank sets the same value.
    Uniform(T),
    /// Ranks disagree, or only some ranks set a value.
    Mixed,
}

impl<T: PartialEq> Setting<T> {
    fn combine(self, other: Setting<T>) -> Self {
        match (self, other) {
            (Setting::Unset, Setting::Unset) => Setting::Unset,
            (Setting::Uniform(a), Setting::Uniform(b)) if a == b => Setting::Uniform(a),
            _ => Setting::Mixed,
        }
    }
}

/// A specification of which programs run on which MPI ranks.
///
/// `RankSpec` is a tree: [`Program`] leaves compose by sequential
/// concatenation (`Sequence`, disjoint rank ranges in program order) and
/// replication (`Replicated`, the same program spread over many ranks).
/// Trees are immutable; the annotating operations return new trees.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RankSpec {
    Program(Program),
    Sequence(Vec<RankSpec>),
    Replicated { child: Box<RankSpec>, count: usize },
}

impl From<Program> for RankSpec {
    fn from(program: Program) -> Self {
        RankSpec::Program(program)
    }
}

impl RankSpec {
    /// Replicate this specification over `count` ranks.
    #[must_use]
    pub fn replicate(self, count: usize) -> Self {
        RankSpec::Replicated {
            child: Box::new(self),
            count,
        }
    }

    /// Run this specification, then `next` on the following ranks.
    #[must_use]
    pub fn then(self, next: impl Into<RankSpec>) -> Self {
        match self {
            RankSpec::Sequence(mut children) => {
                children.push(next.into());
                RankSpec::Sequence(children)
            }
            other => RankSpec::Sequence(vec![other, next.into()]),
        }
    }

    /// The total number of ranks this specification occupies.
    pub fn nranks(&self) -> usize {
        match self {
            RankSpec::Program(_) => 1,
            RankSpec::Sequence(children) => children.iter().map(RankSpec::nranks).sum(),
            RankSpec::Replicated { child, count } => child.nranks() * count,
        }
    }

    /// Classify the tree as `(any_serial, any_parallel)`.
    ///
    /// A valid tree never reports both true: backends must reject such
    /// trees with [`crate::Error::MpiMixed`].
    ///
    pub fn check_serial(&self) -> (bool, bool) {
        match self {
            RankSpec::Program(program) => (program.serial, !program.serial),
            RankSpec::Sequence(children) => children.iter().fold(
                (false, false),
                |(any_serial, any_parallel), child| {
                    let (serial, parallel) = child.check_serial();
                    (any_serial || serial, any_parallel || parallel)
                },
            ),
            RankSpec::Replicated { child, .. } => child.check_serial(),
        }
    }

    /// Summarize the per-rank thread counts.
    ///
    /// A rank with no thread count disagrees with a rank that has one, so
    /// a partially threaded tree reports [`Setting::Mixed`].
    pub fn threads(&self) -> Setting<usize> {
        self.expand_iter(false)
            .map(|(program, _)| match program.threads {
                Some(threads) => Setting::Uniform(threads),
                None => Setting::Unset,
            })
            .reduce(Setting::combine)
            .unwrap_or(Setting::Unset)
    }

    /// Summarize the per-rank launcher options.
    pub fn mixed_local_opts(&self) -> Setting<Vec<String>> {
        self.expand_iter(false)
            .map(|(program, _)| {
                if program.local_opts.is_empty() {
                    Setting::Unset
                } else {
                    Setting::Uniform(program.local_opts.clone())
                }
            })
            .reduce(Setting::combine)
            .unwrap_or(Setting::Unset)
    }

    /// Return a new tree with environment assignments added to every rank.
    #[must_use]
    pub fn with_env(self, vars: &[(String, String)]) -> Self {
        self.map_leaves(&|mut program| {
            program.env.extend(vars.iter().cloned());
            program
        })
    }

    /// Return a new tree with the thread count set on every rank.
    #[must_use]
    pub fn with_threads(self, threads: usize) -> Self {
        self.map_leaves(&|mut program| {
            program.threads = Some(threads);
            program
        })
    }

    pub(crate) fn map_leaves(self, f: &dyn Fn(Program) -> Program) -> Self {
        match self {
            RankSpec::Program(program) => RankSpec::Program(f(program)),
            RankSpec::Sequence(children) => {
                RankSpec::Sequence(children.into_iter().map(|c| c.map_leaves(f)).collect())
            }
            RankSpec::Replicated { child, count } => RankSpec::Replicated {
                child: Box::new(child.map_leaves(f)),
                count,
            },
        }
    }

    fn push_groups<'a>(&'a self, out: &mut Vec<(&'a Program, usize)>) {
        match self {
            RankSpec::Program(program) => out.push((program, 1)),
            RankSpec::Sequence(children) => {
                for child in children {
                    child.push_groups(out);
                }
            }
            RankSpec::Replicated { child, count } => {
                for _ in 0..*count {
                    child.push_groups(out);
                }
            }
        }
    }

    /// Iterate over `(program, count)` pairs of contiguous rank ranges in
    /// execution order.
    ///
    /// With `expand = true` every replicated rank appears as its own
    /// singleton pair. Otherwise adjacent identical ranks merge into one
    /// counted group.
    ///
    pub fn expand_iter(&self, expand: bool) -> impl Iterator<Item = (&Program, usize)> {
        let mut groups = Vec::new();
        self.push_groups(&mut groups);

        if !expand {
            let mut merged: Vec<(&Program, usize)> = Vec::with_capacity(groups.len());
            for (program, count) in groups {
                match merged.last_mut() {
                    Some((last, last_count)) if **last == *program => *last_count += count,
                    _ => merged.push((program, count)),
                }
            }
            groups = merged;
        }

        groups.into_iter()
    }

    /// Merge adjacent identical ranks into counted `Replicated` nodes.
    ///
    /// Collapsing never changes `nranks()` or any rendered output. It is
    /// idempotent.
    ///
    #[must_use]
    pub fn collapse(&self) -> Self {
        let mut nodes: Vec<RankSpec> = self
            .expand_iter(false)
            .map(|(program, count)| {
                if count == 1 {
                    RankSpec::Program(program.clone())
                } else {
                    RankSpec::Replicated {
                        child: Box::new(RankSpec::Program(program.clone())),
                        count,
                    }
                }
            })
            .collect();

        if nodes.len() == 1 {
            nodes.pop().expect("one node")
        } else {
            RankSpec::Sequence(nodes)
        }
    }

    /// Render the tree to an ordered token sequence.
    ///
    /// `pre` is emitted once at the head (the launcher program and its
    /// global flags). `before` is emitted for every rank group with the
    /// placeholders `{n}`, `{first}` and `{last}` substituted by the
    /// group's rank count and inclusive rank range. `between` separates
    /// groups (`":"` for colon-style MPMD launchers). Launcher options
    /// attached to a group's program follow its `before` tokens.
    ///
    /// With `to_shell = true` each group's own command is rendered as one
    /// quoted bash line instead of raw argv tokens, so that each group
    /// becomes one command-file entry.
    ///
    pub fn to_arglist(
        &self,
        pre: &[&str],
        before: &[&str],
        between: &[&str],
        to_shell: bool,
        expand: bool,
    ) -> Vec<String> {
        let mut result: Vec<String> = pre.iter().map(ToString::to_string).collect();
        let mut first_rank = 0;

        for (index, (program, count)) in self.expand_iter(expand).enumerate() {
            if index > 0 {
                result.extend(between.iter().map(ToString::to_string));
            }

            let last_rank = first_rank + count - 1;
            if to_shell {
                let mut line = String::new();
                for token in before {
                    line.push_str(&substitute(token, count, first_rank, last_rank));
                    line.push(' ');
                }
                for opt in &program.local_opts {
                    line.push_str(opt);
                    line.push(' ');
                }
                line.push_str(&program.shell_line());
                result.push(line);
            } else {
                result.extend(
                    before
                        .iter()
                        .map(|token| substitute(token, count, first_rank, last_rank)),
                );
                result.extend(program.local_opts.iter().cloned());
                result.extend(program.arglist());
            }

            first_rank += count;
        }

        result
    }
}

fn substitute(token: &str, count: usize, first: usize, last: usize) -> String {
    token
        .replace("{n}", &count.to_string())
        .replace("{first}", &first.to_string())
        .replace("{last}", &last.to_string())
}

#[cfg(test)]
mod tests {
    use serial_test::parallel;

    use super::*;

    fn setup() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    fn two_groups() -> RankSpec {
        RankSpec::from(Program::new("prog1"))
            .replicate(140)
            .then(RankSpec::from(Program::new("prog2").threads(2)).replicate(50))
    }

    #[test]
    #[parallel]
    fn nranks() {
        setup();
        assert_eq!(RankSpec::from(Program::new("a")).nranks(), 1);
        assert_eq!(two_groups().nranks(), 190);

        let nested = RankSpec::from(Program::new("a")).replicate(3).replicate(2);
        assert_eq!(nested.nranks(), 6);
    }

    #[test]
    #[parallel]
    fn nranks_matches_expansion() {
        setup();
        for spec in [
            RankSpec::from(Program::new("a")),
            two_groups(),
            RankSpec::from(Program::new("a")).replicate(3).replicate(2),
            RankSpec::from(Program::new("a"))
                .then(Program::new("a"))
                .then(Program::new("b")),
        ] {
            let expanded: usize = spec.expand_iter(true).map(|(_, count)| count).sum();
            let merged: usize = spec.expand_iter(false).map(|(_, count)| count).sum();
            assert_eq!(spec.nranks(), expanded);
            assert_eq!(spec.nranks(), merged);
        }
    }

    #[test]
    #[parallel]
    fn check_serial_composition() {
        setup();
        let serial = RankSpec::from(Program::serial("ls"));
        let parallel = RankSpec::from(Program::new("model"));

        assert_eq!(serial.check_serial(), (true, false));
        assert_eq!(parallel.check_serial(), (false, true));
        assert_eq!(
            serial.clone().then(Program::serial("du")).check_serial(),
            (true, false)
        );
        assert_eq!(
            parallel.clone().then(Program::new("post")).check_serial(),
            (false, true)
        );
        assert_eq!(serial.then(parallel).check_serial(), (true, true));
    }

    #[test]
    #[parallel]
    fn adjacent_identical_ranks_merge() {
        setup();
        let spec = RankSpec::from(Program::new("a"))
            .then(Program::new("a"))
            .then(Program::new("b"));

        let groups: Vec<(String, usize)> = spec
            .expand_iter(false)
            .map(|(program, count)| (program.executable.clone(), count))
            .collect();
        assert_eq!(groups, vec![("a".to_string(), 2), ("b".to_string(), 1)]);

        let expanded: Vec<usize> = spec.expand_iter(true).map(|(_, count)| count).collect();
        assert_eq!(expanded, vec![1, 1, 1]);
    }

    #[test]
    #[parallel]
    fn collapse_is_idempotent() {
        setup();
        let spec = RankSpec::from(Program::new("a"))
            .then(Program::new("a"))
            .then(RankSpec::from(Program::new("b")).replicate(4));

        let once = spec.collapse();
        let twice = once.collapse();
        assert_eq!(once, twice);
        assert_eq!(once.nranks(), spec.nranks());
        assert_eq!(
            once.to_arglist(&[], &["-np", "{n}"], &[":"], false, false),
            spec.to_arglist(&[], &["-np", "{n}"], &[":"], false, false)
        );
    }

    #[test]
    #[parallel]
    fn threads_setting() {
        setup();
        assert_eq!(RankSpec::from(Program::new("a")).threads(), Setting::Unset);
        assert_eq!(
            RankSpec::from(Program::new("a").threads(4)).threads(),
            Setting::Uniform(4)
        );
        assert_eq!(
            RankSpec::from(Program::new("a").threads(4))
                .then(Program::new("b").threads(4))
                .threads(),
            Setting::Uniform(4)
        );
        assert_eq!(two_groups().threads(), Setting::Mixed);
        // A thread count on only part of the tree is also mixed.
        assert_eq!(
            RankSpec::from(Program::new("a"))
                .then(Program::new("b").threads(2))
                .threads(),
            Setting::Mixed
        );
    }

    #[test]
    #[parallel]
    fn local_opts_setting() {
        setup();
        assert_eq!(
            RankSpec::from(Program::new("a")).mixed_local_opts(),
            Setting::Unset
        );
        assert_eq!(
            RankSpec::from(Program::new("a").local_opt("-f"))
                .then(Program::new("b").local_opt("-g"))
                .mixed_local_opts(),
            Setting::Mixed
        );
        assert_eq!(
            RankSpec::from(Program::new("a").local_opt("-f"))
                .then(Program::new("b").local_opt("-f"))
                .mixed_local_opts(),
            Setting::Uniform(vec!["-f".to_string()])
        );
        assert_eq!(
            RankSpec::from(Program::new("a").local_opt("-f"))
                .then(Program::new("b"))
                .mixed_local_opts(),
            Setting::Mixed
        );
    }

    #[test]
    #[parallel]
    fn with_env_annotates_every_rank() {
        setup();
        let spec = two_groups().with_env(&[("OMP_NUM_THREADS".to_string(), "2".to_string())]);
        for (program, _) in spec.expand_iter(false) {
            assert!(program
                .env
                .contains(&("OMP_NUM_THREADS".to_string(), "2".to_string())));
        }
    }

    #[test]
    #[parallel]
    fn arglist_mpmd_groups() {
        setup();
        let argv = two_groups().to_arglist(&["mpirun"], &["-np", "{n}"], &[":"], false, false);
        let expected: Vec<String> = ["mpirun", "-np", "140", "prog1", ":", "-np", "50", "prog2"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(argv, expected);
    }

    #[test]
    #[parallel]
    fn arglist_per_rank_env() {
        setup();
        let spec = RankSpec::from(Program::new("prog1")).then(Program::new("prog2").env("A", "b"));
        let argv = spec.to_arglist(&["mpirun"], &["-np", "{n}"], &[":"], false, false);
        let expected: Vec<String> = [
            "mpirun",
            "-np",
            "1",
            "prog1",
            ":",
            "-np",
            "1",
            "/usr/bin/env",
            "A=b",
            "prog2",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(argv, expected);
    }

    #[test]
    #[parallel]
    fn shell_lines_expand_replicates() {
        setup();
        let spec = RankSpec::from(Program::serial("ls").arg("-l")).replicate(3);
        let lines = spec.to_arglist(&[], &[], &[], true, true);
        assert_eq!(lines, vec!["ls -l", "ls -l", "ls -l"]);
    }

    #[test]
    #[parallel]
    fn shell_lines_rank_ranges() {
        setup();
        let lines = two_groups().to_arglist(&[], &["{first}-{last}"], &[], true, false);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0-139 "));
        assert!(lines[1].starts_with("140-189 "));
        assert!(lines[0].ends_with("prog1"));
    }

    #[test]
    #[parallel]
    fn shell_line_quotes_arguments() {
        setup();
        let program = Program::serial("/bin/echo")
            .arg("hello world")
            .env("A", "b c");
        assert_eq!(program.shell_line(), "A=$'b c' /bin/echo $'hello world'");
    }
}
