use log::{debug, trace};
use std::path::PathBuf;
use std::process::{Command as Process, Stdio};

use super::{
    annotate_openmp, compile_colon, find_in_path, intel_openmp_env, launcher_path, Backend,
    ColonParams, LaunchOptions, SerialResolver,
};
use crate::command::Command;
use crate::config::BackendSettings;
use crate::rankspec::RankSpec;
use crate::Error;

pub(crate) const NAME: &str = "impi";
const DEFAULT_LAUNCHER: &str = "mpirun";

/// Intel MPI, launched through its `mpirun` wrapper.
pub struct IntelMpi {
    launcher: PathBuf,
    mpiserial: SerialResolver,
    total_tasks: Option<usize>,
}

impl IntelMpi {
    /// Match when `mpirun` is present and reports an Intel runtime.
    ///
    /// Other MPI stacks ship an `mpirun` wrapper too, so the probe runs
    /// `mpirun --version` and requires "Intel" in the output. MPICH sites
    /// fall through to the `mpich` backend.
    ///
    pub fn probe(settings: &BackendSettings) -> Option<Self> {
        let launcher = launcher_path(settings, DEFAULT_LAUNCHER);
        let found = find_in_path(launcher.to_str()?)?;

        let output = Process::new(&found)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .ok()?;
        let version = String::from_utf8_lossy(&output.stdout);
        if !version.contains("Intel") {
            trace!("'{}' is not an Intel MPI launcher.", found.display());
            return None;
        }

        debug!("Found Intel MPI launcher '{}'.", found.display());
        Some(Self::force(settings))
    }

    /// Construct without probing the environment.
    pub fn force(settings: &BackendSettings) -> Self {
        IntelMpi {
            launcher: launcher_path(settings, DEFAULT_LAUNCHER),
            mpiserial: SerialResolver::new(settings.mpiserial.clone()),
            total_tasks: settings.total_tasks,
        }
    }
}

impl Backend for IntelMpi {
    fn name(&self) -> &'static str {
        NAME
    }

    fn openmp(&self, spec: RankSpec, threads: usize) -> Result<RankSpec, Error> {
        Ok(annotate_openmp(spec, &intel_openmp_env(threads), threads))
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        compile_colon(
            &ColonParams {
                backend: NAME,
                launcher: &self.launcher,
                np_flag: "-np",
                label_flags: &["-l"],
                serial_env: &[],
                openmp_env: intel_openmp_env,
            },
            spec,
            options,
            &self.mpiserial,
            self.total_tasks,
        )
    }
}
