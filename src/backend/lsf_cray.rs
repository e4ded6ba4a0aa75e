use log::{debug, warn};
use std::env;
use std::path::PathBuf;

use super::{
    annotate_openmp, compile_colon, find_in_path, intel_openmp_env, launcher_path, Backend,
    ColonParams, LaunchOptions, SerialResolver,
};
use crate::command::Command;
use crate::config::BackendSettings;
use crate::rankspec::RankSpec;
use crate::{Error, INSIDE_APRUN_VARIABLE};

pub(crate) const NAME: &str = "lsf_cray";
const DEFAULT_LAUNCHER: &str = "aprun";

/// Cray `aprun` under an LSF batch allocation.
///
/// Placement is expressed per rank group through `aprun` flags derived
/// from each rank's annotations: `-cc depth -d <threads>` for OpenMP
/// depth, `-N <ranks>` for node placement and `--p-state <kHz>` for
/// turbo requests. Every compiled command increments the `INSIDE_APRUN`
/// counter so a launched program can itself run serial sub-programs.
///
pub struct LsfCray {
    launcher: PathBuf,
    mpiserial: SerialResolver,
    total_tasks: Option<usize>,
    p_state_turbo: Option<u64>,
}

impl LsfCray {
    /// Match inside an LSF job with `aprun` available.
    pub fn probe(settings: &BackendSettings) -> Option<Self> {
        env::var_os("LSB_JOBID")?;
        let launcher = launcher_path(settings, DEFAULT_LAUNCHER);
        find_in_path(launcher.to_str()?)?;
        debug!("Found Cray LSF allocation with '{}'.", launcher.display());
        Some(Self::force(settings))
    }

    /// Construct without probing the environment.
    pub fn force(settings: &BackendSettings) -> Self {
        LsfCray {
            launcher: launcher_path(settings, DEFAULT_LAUNCHER),
            mpiserial: SerialResolver::new(settings.mpiserial.clone()),
            total_tasks: settings.total_tasks,
            p_state_turbo: settings.p_state_turbo,
        }
    }

    /// Prepend per-group `aprun` placement flags derived from each rank's
    /// annotations.
    fn place(&self, spec: &RankSpec, options: &LaunchOptions) -> RankSpec {
        let p_state = options.p_state_turbo.or(self.p_state_turbo);
        spec.clone().map_leaves(&|mut program| {
            let mut opts = Vec::new();
            if let Some(threads) = program.thread_count() {
                opts.extend([
                    "-cc".to_string(),
                    "depth".to_string(),
                    "-d".to_string(),
                    threads.to_string(),
                ]);
            }
            if let Some(ranks) = program.node_ranks().or(options.ranks_per_node) {
                opts.extend(["-N".to_string(), ranks.to_string()]);
            }
            if program.wants_turbo() {
                match p_state {
                    Some(khz) => opts.extend(["--p-state".to_string(), khz.to_string()]),
                    None => {
                        warn!("No p-state frequency configured; ignoring the turbo request.");
                    }
                }
            }
            program.local_opts.splice(0..0, opts);
            program
        })
    }
}

impl Backend for LsfCray {
    fn name(&self) -> &'static str {
        NAME
    }

    fn openmp(&self, spec: RankSpec, threads: usize) -> Result<RankSpec, Error> {
        Ok(annotate_openmp(spec, &intel_openmp_env(threads), threads))
    }

    /// Wrap a bare executable so it runs on a compute node.
    ///
    /// Batch scripts on Cray run on service nodes that cannot execute
    /// compute-node binaries directly.
    fn make_bigexe(&self, executable: &str) -> Command {
        let argv: Vec<String> = vec![
            self.launcher.to_string_lossy().into_owned(),
            "-q".to_string(),
            "-n".to_string(),
            "1".to_string(),
            executable.to_string(),
        ];
        Command::new(argv).increment_env_counter(INSIDE_APRUN_VARIABLE)
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        if options.label_io {
            debug!("aprun has no rank labeling flag; ignoring the request.");
        }

        // Serial trees run under mpiserial; their shell lines must not
        // carry aprun placement flags.
        let placed = if spec.check_serial().0 {
            spec.clone()
        } else {
            self.place(spec, options)
        };

        let command = compile_colon(
            &ColonParams {
                backend: NAME,
                launcher: &self.launcher,
                np_flag: "-n",
                label_flags: &[],
                serial_env: &[],
                openmp_env: intel_openmp_env,
            },
            &placed,
            options,
            &self.mpiserial,
            self.total_tasks,
        )?;

        Ok(command.increment_env_counter(INSIDE_APRUN_VARIABLE))
    }

    // Syncing from Cray service nodes stalls on Lustre.
    fn runsync(&self) {}
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::rankspec::Program;

    fn setup() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    fn backend() -> LsfCray {
        LsfCray::force(&BackendSettings::default())
    }

    #[test]
    #[serial]
    fn placement_flags_per_group() {
        setup();
        env::remove_var(INSIDE_APRUN_VARIABLE);
        let spec = RankSpec::from(Program::new("model").threads(6).ranks_per_node(2)).replicate(4);

        let command = backend()
            .mpirunner(&spec, &LaunchOptions::default())
            .expect("compiles");

        let expected: Vec<String> = [
            "aprun", "-n", "4", "-cc", "depth", "-d", "6", "-N", "2", "model",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(command.argv(), expected.as_slice());

        // Uniform threads also land in the command environment.
        assert!(command
            .environment()
            .contains(&("OMP_NUM_THREADS".to_string(), "6".to_string())));
        assert!(command
            .environment()
            .contains(&(INSIDE_APRUN_VARIABLE.to_string(), "1".to_string())));
    }

    #[test]
    #[serial]
    fn turbo_mode_with_configured_frequency() {
        setup();
        env::remove_var(INSIDE_APRUN_VARIABLE);
        let settings = BackendSettings {
            p_state_turbo: Some(2_601_000),
            ..BackendSettings::default()
        };
        let backend = LsfCray::force(&settings);
        let spec = RankSpec::from(Program::new("model").turbo(true)).replicate(2);

        let command = backend
            .mpirunner(&spec, &LaunchOptions::default())
            .expect("compiles");
        let expected: Vec<String> = ["aprun", "-n", "2", "--p-state", "2601000", "model"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(command.argv(), expected.as_slice());
    }

    #[test]
    #[serial]
    fn turbo_mode_without_configured_frequency() {
        setup();
        env::remove_var(INSIDE_APRUN_VARIABLE);
        let spec = RankSpec::from(Program::new("model").turbo(true)).replicate(2);

        let command = backend()
            .mpirunner(&spec, &LaunchOptions::default())
            .expect("compiles");
        assert_eq!(command.argv(), &["aprun", "-n", "2", "model"]);
    }

    #[test]
    #[serial]
    fn nesting_counter_increments() {
        setup();
        env::set_var(INSIDE_APRUN_VARIABLE, "1");
        let command = backend()
            .mpirunner(
                &RankSpec::from(Program::new("model")).replicate(2),
                &LaunchOptions::default(),
            )
            .expect("compiles");
        assert!(command
            .environment()
            .contains(&(INSIDE_APRUN_VARIABLE.to_string(), "2".to_string())));
        env::remove_var(INSIDE_APRUN_VARIABLE);
    }

    #[test]
    #[serial]
    fn serial_lines_carry_no_placement_flags() {
        setup();
        env::remove_var(INSIDE_APRUN_VARIABLE);
        let settings = BackendSettings {
            mpiserial: Some(PathBuf::from("/opt/bin/mpiserial")),
            ..BackendSettings::default()
        };
        let backend = LsfCray::force(&settings);
        let spec = RankSpec::from(Program::serial("ls").arg("-l")).replicate(3);

        let command = backend
            .mpirunner(&spec, &LaunchOptions::default())
            .expect("compiles");
        assert_eq!(
            command.argv(),
            &["aprun", "-n", "3", "/opt/bin/mpiserial"]
        );
        let file = command.get_command_file().expect("serial command file");
        assert_eq!(file.lines(), &["ls -l"; 3]);
    }

    #[test]
    #[serial]
    fn bigexe_wrapper() {
        setup();
        env::remove_var(INSIDE_APRUN_VARIABLE);
        let command = backend().make_bigexe("./exhpc");
        assert_eq!(command.argv(), &["aprun", "-q", "-n", "1", "./exhpc"]);
        assert!(command
            .environment()
            .contains(&(INSIDE_APRUN_VARIABLE.to_string(), "1".to_string())));
    }
}
