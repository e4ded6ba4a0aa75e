pub mod impi;
pub mod inside_aprun;
pub mod lsf;
pub mod lsf_cray;
pub mod mpich;
pub mod mpt;
pub mod no_mpi;
pub mod srun;

use log::{debug, info, trace, warn};
use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::cmdfile::CommandFile;
use crate::command::Command;
use crate::config::{BackendSettings, Configuration};
use crate::rankspec::{Program, RankSpec, Setting};
use crate::{Error, SERIAL_COMMAND_FILE_VARIABLE};

/// Caller options for one `mpirunner` compilation.
#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// Spread a single-rank specification over every available task slot.
    pub allranks: bool,

    /// Prefix each rank's output with its rank number where supported.
    pub label_io: bool,

    /// Override the total task count (otherwise `TOTAL_TASKS`/`PBS_NP`).
    pub total_tasks: Option<usize>,

    /// Override the node size (otherwise `PRODUTIL_RUN_NODESIZE` and
    /// friends).
    pub nodesize: Option<usize>,

    /// Default ranks-per-node for ranks that do not set their own.
    pub ranks_per_node: Option<usize>,

    /// CPU frequency (in kHz) to request for turbo-mode ranks on `aprun`.
    pub p_state_turbo: Option<u64>,
}

/// One MPI launch backend.
///
/// Exactly one backend is selected per process by [`detect`]. Backends
/// are stateless compilers apart from their lazily resolved helper
/// paths, so concurrent `mpirunner` calls may interleave freely.
///
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Whether this backend can launch true multi-rank MPI programs.
    fn can_run_mpi(&self) -> bool {
        true
    }

    /// Annotate a specification with an OpenMP thread count.
    ///
    /// Sets `threads` on every rank and injects the backend's OpenMP
    /// environment variables.
    ///
    /// # Errors
    /// `Err(Error::OpenMpDisabled)` on backends that cannot run threaded
    /// programs.
    ///
    fn openmp(&self, spec: RankSpec, threads: usize) -> Result<RankSpec, Error> {
        Ok(annotate_openmp(spec, &basic_openmp_env(threads), threads))
    }

    /// Wrap a bare executable for execution on a compute node.
    ///
    /// Most backends run batch and compute work on the same node; the
    /// default is a pass-through.
    fn make_bigexe(&self, executable: &str) -> Command {
        Command::new([executable])
    }

    /// Compile a rank specification into a runnable [`Command`].
    ///
    /// # Errors
    /// The topology errors of [`crate::Error`]: `MpiMixed`,
    /// `MpiThreadsMixed`, `MpiLocalOptsMixed`, `MpiAllRanks`,
    /// `MpiTooManyRanks`, `MpiSerialMissing`, `MpiDisabled`.
    ///
    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error>;

    /// Best-effort filesystem sync around a run.
    fn runsync(&self) {
        nix::unistd::sync();
    }
}

/// Backend names in detection order.
pub const DETECTION_ORDER: [&str; 8] = [
    lsf_cray::NAME,
    srun::NAME,
    inside_aprun::NAME,
    lsf::NAME,
    impi::NAME,
    mpt::NAME,
    mpich::NAME,
    no_mpi::NAME,
];

/// Select the backend for this process.
///
/// Probes each backend in [`DETECTION_ORDER`] and returns the first that
/// matches the current environment. The `no_mpi` fallback always
/// matches. A `force` entry in the configuration pins the choice without
/// probing.
///
pub fn detect(config: &Configuration) -> Box<dyn Backend> {
    if let Some(name) = config.force() {
        match by_name(name, config) {
            Ok(backend) => {
                info!("Backend '{name}' forced by configuration.");
                return backend;
            }
            Err(error) => warn!("Ignoring forced backend: {error}"),
        }
    }

    for name in DETECTION_ORDER {
        trace!("Probing backend '{name}'.");
        if let Some(backend) = probe(name, config) {
            info!("Detected backend '{}'.", backend.name());
            return backend;
        }
    }

    // The no_mpi probe never fails; this is unreachable in practice.
    Box::new(no_mpi::NoMpi::force(&config.settings(no_mpi::NAME)))
}

/// Probe one backend by name.
///
/// # Returns
/// `None` when the backend does not match the current environment or the
/// name is unknown.
pub fn probe(name: &str, config: &Configuration) -> Option<Box<dyn Backend>> {
    let settings = config.settings(name);
    match name {
        lsf_cray::NAME => lsf_cray::LsfCray::probe(&settings).map(boxed),
        srun::NAME => srun::Srun::probe(&settings).map(boxed),
        inside_aprun::NAME => inside_aprun::InsideAprun::probe(&settings).map(boxed),
        lsf::NAME => lsf::MpirunLsf::probe(&settings).map(boxed),
        impi::NAME => impi::IntelMpi::probe(&settings).map(boxed),
        mpt::NAME => mpt::SgiMpt::probe(&settings).map(boxed),
        mpich::NAME => mpich::Mpich::probe(&settings).map(boxed),
        no_mpi::NAME => Some(boxed(no_mpi::NoMpi::force(&settings))),
        _ => None,
    }
}

/// Construct a backend by name without probing the environment.
///
/// # Errors
/// `Err(Error::BackendNameNotFound)` for unknown names.
///
pub fn by_name(name: &str, config: &Configuration) -> Result<Box<dyn Backend>, Error> {
    let settings = config.settings(name);
    match name {
        lsf_cray::NAME => Ok(boxed(lsf_cray::LsfCray::force(&settings))),
        srun::NAME => Ok(boxed(srun::Srun::force(&settings))),
        inside_aprun::NAME => Ok(boxed(inside_aprun::InsideAprun::force(&settings))),
        lsf::NAME => Ok(boxed(lsf::MpirunLsf::force(&settings))),
        impi::NAME => Ok(boxed(impi::IntelMpi::force(&settings))),
        mpt::NAME => Ok(boxed(mpt::SgiMpt::force(&settings))),
        mpich::NAME => Ok(boxed(mpich::Mpich::force(&settings))),
        no_mpi::NAME => Ok(boxed(no_mpi::NoMpi::force(&settings))),
        _ => Err(Error::BackendNameNotFound(name.to_string())),
    }
}

fn boxed<B: Backend + 'static>(backend: B) -> Box<dyn Backend> {
    Box::new(backend)
}

/// Search `$PATH` for an executable.
///
/// Names containing a path separator are checked directly.
pub(crate) fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|directory| directory.join(candidate))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// The configured launcher path, or the backend's default binary name.
pub(crate) fn launcher_path(settings: &BackendSettings, default: &str) -> PathBuf {
    settings
        .launcher
        .clone()
        .unwrap_or_else(|| PathBuf::from(default))
}

/// The lazily resolved path to the `mpiserial` helper program.
///
/// Resolved from `$PATH` at most once per backend instance. An explicit
/// configuration override takes precedence and skips the search.
///
#[derive(Debug, Default)]
pub(crate) struct SerialResolver {
    configured: Option<PathBuf>,
    resolved: OnceLock<Option<PathBuf>>,
}

impl SerialResolver {
    pub(crate) fn new(configured: Option<PathBuf>) -> Self {
        SerialResolver {
            configured,
            resolved: OnceLock::new(),
        }
    }

    pub(crate) fn resolve(&self) -> Result<PathBuf, Error> {
        if let Some(configured) = &self.configured {
            return Ok(configured.clone());
        }

        self.resolved
            .get_or_init(|| {
                debug!("Searching $PATH for mpiserial.");
                find_in_path("mpiserial")
            })
            .clone()
            .ok_or(Error::MpiSerialMissing)
    }
}

/// Resolve the total number of available task slots.
pub(crate) fn resolve_total_tasks(
    options: &LaunchOptions,
    configured: Option<usize>,
) -> Result<usize, Error> {
    if let Some(total) = options.total_tasks.or(configured) {
        return Ok(total);
    }

    for variable in ["TOTAL_TASKS", "PBS_NP"] {
        if let Ok(value) = env::var(variable) {
            return value
                .parse()
                .map_err(|_| Error::UnexpectedOutput(variable.into(), value));
        }
    }

    Err(Error::TotalTasksUnknown)
}

/// Resolve the number of task slots per node, if known.
///
/// `PRODUTIL_RUN_HYPERTHREADS` multiplies the physical core count when
/// the site allows hyperthreaded packing.
pub(crate) fn resolve_node_size(
    options: &LaunchOptions,
    configured: Option<usize>,
) -> Option<usize> {
    let physical = options.nodesize.or(configured).or_else(|| {
        for variable in ["PRODUTIL_RUN_NODESIZE", "PBS_NUM_PPN"] {
            if let Some(value) = env::var(variable).ok().and_then(|v| v.parse().ok()) {
                return Some(value);
            }
        }
        None
    })?;

    let hyperthreads: usize = env::var("PRODUTIL_RUN_HYPERTHREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    Some(physical * hyperthreads.max(1))
}

/// OpenMP environment for generic backends.
pub(crate) fn basic_openmp_env(threads: usize) -> Vec<(String, String)> {
    vec![("OMP_NUM_THREADS".to_string(), threads.to_string())]
}

/// OpenMP environment for Intel runtimes.
pub(crate) fn intel_openmp_env(threads: usize) -> Vec<(String, String)> {
    vec![
        ("OMP_NUM_THREADS".to_string(), threads.to_string()),
        ("KMP_NUM_THREADS".to_string(), threads.to_string()),
        ("KMP_AFFINITY".to_string(), "scatter".to_string()),
        ("MKL_NUM_THREADS".to_string(), "1".to_string()),
    ]
}

/// Set `threads` on every rank and inject the OpenMP environment into
/// each rank's per-rank environment.
pub(crate) fn annotate_openmp(
    spec: RankSpec,
    env: &[(String, String)],
    threads: usize,
) -> RankSpec {
    spec.with_threads(threads).with_env(env)
}

/// Validate the serial/parallel classification of a tree.
///
/// # Returns
/// `Ok(true)` for an all-serial tree, `Ok(false)` for all-parallel.
pub(crate) fn validate_classification(spec: &RankSpec) -> Result<bool, Error> {
    if spec.nranks() == 0 {
        return Err(Error::EmptySpec);
    }
    match spec.check_serial() {
        (true, true) => Err(Error::MpiMixed),
        (any_serial, _) => Ok(any_serial),
    }
}

/// Propagate a uniform thread count onto the compiled command.
pub(crate) fn apply_threads(
    command: Command,
    spec: &RankSpec,
    openmp_env: fn(usize) -> Vec<(String, String)>,
) -> Command {
    match spec.threads() {
        Setting::Uniform(threads) => command.envs(&openmp_env(threads)),
        Setting::Unset | Setting::Mixed => command,
    }
}

/// Run a serial program directly, without any launcher.
pub(crate) fn direct_command(program: &Program) -> Command {
    let mut argv = vec![program.executable().to_string()];
    argv.extend(program.args.iter().cloned());
    Command::new(argv).envs(&program.env)
}

/// Fixed parameters of a colon-syntax MPMD launcher.
///
/// Intel MPI, MPICH and SGI MPT share the `launcher [-flags] -np N prog
/// : -np M prog` grammar; only the launcher path, flag spellings and
/// serial-run environment differ.
pub(crate) struct ColonParams<'a> {
    pub backend: &'static str,
    pub launcher: &'a Path,
    pub np_flag: &'static str,
    pub label_flags: &'static [&'static str],
    pub serial_env: &'static [(&'static str, &'static str)],
    pub openmp_env: fn(usize) -> Vec<(String, String)>,
}

/// Shared `mpirunner` compilation for colon-syntax launchers.
pub(crate) fn compile_colon(
    params: &ColonParams,
    spec: &RankSpec,
    options: &LaunchOptions,
    mpiserial: &SerialResolver,
    configured_total: Option<usize>,
) -> Result<Command, Error> {
    let any_serial = validate_classification(spec)?;

    let nranks = spec.nranks();
    if options.allranks && nranks > 1 {
        return Err(Error::MpiAllRanks(nranks));
    }

    let launcher = params
        .launcher
        .to_str()
        .ok_or_else(|| Error::NonUTF8Path(params.launcher.to_path_buf()))?;
    let mut pre: Vec<&str> = vec![launcher];
    if options.label_io {
        pre.extend_from_slice(params.label_flags);
    }

    let command = if any_serial {
        let serial_path = mpiserial.resolve()?;
        let serial_str = serial_path
            .to_str()
            .ok_or_else(|| Error::NonUTF8Path(serial_path.clone()))?;

        let collapsed = spec.collapse();
        let mut lines = collapsed.to_arglist(&[], &[], &[], true, true);
        let ntasks = if options.allranks {
            let total = resolve_total_tasks(options, configured_total)?;
            lines = vec![lines[0].clone(); total];
            total
        } else {
            nranks
        };

        debug!(
            "Compiling {} serial run of {ntasks} ranks under mpiserial.",
            params.backend
        );
        let mut command = Command::new(pre)
            .arg(params.np_flag)
            .arg(ntasks.to_string())
            .arg(serial_str)
            .command_file(CommandFile::new(
                "serialcmdf",
                lines,
                SERIAL_COMMAND_FILE_VARIABLE,
            ));
        for (name, value) in params.serial_env {
            command = command.env(*name, *value);
        }
        command
    } else if options.allranks {
        let total = resolve_total_tasks(options, configured_total)?;
        debug!(
            "Compiling {} run over all {total} available ranks.",
            params.backend
        );
        let np = total.to_string();
        let before = [params.np_flag, np.as_str()];
        Command::new(spec.to_arglist(&pre, &before, &[], false, false))
    } else {
        Command::new(spec.to_arglist(&pre, &[params.np_flag, "{n}"], &[":"], false, false))
    };

    Ok(apply_threads(command, spec, params.openmp_env))
}
