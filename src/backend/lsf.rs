use log::debug;
use std::env;
use std::path::PathBuf;

use super::{
    apply_threads, basic_openmp_env, find_in_path, launcher_path, validate_classification,
    Backend, LaunchOptions, SerialResolver,
};
use crate::cmdfile::CommandFile;
use crate::command::Command;
use crate::config::BackendSettings;
use crate::rankspec::{RankSpec, Setting};
use crate::{Error, SERIAL_COMMAND_FILE_VARIABLE};

pub(crate) const NAME: &str = "mpirun_lsf";
const DEFAULT_LAUNCHER: &str = "mpirun.lsf";

/// IBM Parallel Environment under LSF, launched through `mpirun.lsf`.
///
/// The launcher takes its rank count and placement from the LSF
/// allocation, not from argv, which forces two workarounds: a
/// `LSB_PJL_TASK_GEOMETRY` override for single-rank runs, and the POE
/// command file (`MP_CMDFILE`, `MP_PGMMODEL=MPMD`) for heterogeneous
/// runs.
///
pub struct MpirunLsf {
    launcher: PathBuf,
    mpiserial: SerialResolver,
}

impl MpirunLsf {
    /// Match inside an LSF allocation with `mpirun.lsf` available.
    pub fn probe(settings: &BackendSettings) -> Option<Self> {
        env::var_os("LSB_MCPU_HOSTS")?;
        let launcher = launcher_path(settings, DEFAULT_LAUNCHER);
        find_in_path(launcher.to_str()?)?;
        debug!("Found LSF allocation with '{}'.", launcher.display());
        Some(Self::force(settings))
    }

    /// Construct without probing the environment.
    pub fn force(settings: &BackendSettings) -> Self {
        MpirunLsf {
            launcher: launcher_path(settings, DEFAULT_LAUNCHER),
            mpiserial: SerialResolver::new(settings.mpiserial.clone()),
        }
    }
}

impl Backend for MpirunLsf {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        let any_serial = validate_classification(spec)?;

        // Neither the geometry hack nor the command file can vary thread
        // counts or launcher options between ranks.
        if matches!(spec.threads(), Setting::Mixed) {
            return Err(Error::MpiThreadsMixed(NAME.to_string()));
        }
        if !matches!(spec.mixed_local_opts(), Setting::Unset) {
            return Err(Error::MpiLocalOptsMixed(NAME.to_string()));
        }

        let nranks = spec.nranks();
        if options.allranks && nranks > 1 {
            return Err(Error::MpiAllRanks(nranks));
        }

        let launcher = self
            .launcher
            .to_str()
            .ok_or_else(|| Error::NonUTF8Path(self.launcher.clone()))?;

        let command = if any_serial {
            let serial_path = self.mpiserial.resolve()?;
            let serial = serial_path
                .to_str()
                .ok_or_else(|| Error::NonUTF8Path(serial_path.clone()))?;
            let lines = spec.collapse().to_arglist(&[], &[], &[], true, true);
            debug!(
                "Compiling {NAME} serial run of {} ranks under mpiserial.",
                lines.len()
            );
            Command::new([launcher, serial]).command_file(CommandFile::new(
                "serialcmdf",
                lines,
                SERIAL_COMMAND_FILE_VARIABLE,
            ))
        } else if spec.expand_iter(false).count() > 1 {
            let lines = spec.to_arglist(&[], &[], &[], true, true);
            debug!("Compiling {NAME} MPMD run of {} ranks.", lines.len());
            Command::new([launcher]).command_file(
                CommandFile::new("poecmdf", lines, "MP_CMDFILE")
                    .model_var("MP_PGMMODEL", "MPMD"),
            )
        } else {
            // mpirun.lsf takes the rank count from the batch allocation.
            debug!("Compiling {NAME} run; the allocation decides the rank count.");
            let mut command = Command::new(spec.to_arglist(&[launcher], &[], &[], false, false));
            if nranks == 1 && !options.allranks {
                // Pin the program to rank 0 despite the allocation.
                command = command.env("LSB_PJL_TASK_GEOMETRY", "{(0)}");
            }
            command
        };

        let command = if options.label_io {
            command.env("MP_LABELIO", "yes")
        } else {
            command
        };

        Ok(apply_threads(command, spec, basic_openmp_env))
    }
}
