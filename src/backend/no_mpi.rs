use log::debug;

use super::{
    direct_command, resolve_total_tasks, validate_classification, Backend, LaunchOptions,
};
use crate::command::Command;
use crate::config::BackendSettings;
use crate::rankspec::RankSpec;
use crate::Error;

pub(crate) const NAME: &str = "no_mpi";

/// Fallback for machines with no MPI stack at all.
///
/// Runs single serial programs directly and refuses everything else.
/// Always matches, so it terminates the detection chain.
///
pub struct NoMpi {
    total_tasks: Option<usize>,
}

impl NoMpi {
    /// Construct without probing the environment.
    pub fn force(settings: &BackendSettings) -> Self {
        NoMpi {
            total_tasks: settings.total_tasks,
        }
    }
}

impl Backend for NoMpi {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_run_mpi(&self) -> bool {
        false
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        let any_serial = validate_classification(spec)?;
        if !any_serial || spec.nranks() != 1 {
            return Err(Error::MpiDisabled(NAME.to_string()));
        }
        if options.allranks && resolve_total_tasks(options, self.total_tasks)? != 1 {
            return Err(Error::MpiDisabled(NAME.to_string()));
        }

        let Some((program, _)) = spec.expand_iter(true).next() else {
            return Err(Error::MpiDisabled(NAME.to_string()));
        };
        debug!("Running '{}' directly without MPI.", program.executable());
        Ok(direct_command(program))
    }
}
