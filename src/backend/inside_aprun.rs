use log::debug;
use std::env;

use super::{
    annotate_openmp, basic_openmp_env, direct_command, validate_classification, Backend,
    LaunchOptions,
};
use crate::command::Command;
use crate::config::BackendSettings;
use crate::rankspec::RankSpec;
use crate::{Error, INSIDE_APRUN_VARIABLE};

pub(crate) const NAME: &str = "inside_aprun";

/// Execution on a Cray compute node, underneath a running `aprun`.
///
/// Nested parallel launch is invalid there. Single serial programs run
/// directly, without any launcher; everything else is refused.
///
pub struct InsideAprun;

impl InsideAprun {
    /// Match when the `INSIDE_APRUN` nesting counter is at least one.
    pub fn probe(_settings: &BackendSettings) -> Option<Self> {
        let depth: u32 = env::var(INSIDE_APRUN_VARIABLE).ok()?.parse().ok()?;
        if depth < 1 {
            return None;
        }
        debug!("Running at aprun nesting depth {depth}.");
        Some(InsideAprun)
    }

    /// Construct without probing the environment.
    pub fn force(_settings: &BackendSettings) -> Self {
        InsideAprun
    }
}

impl Backend for InsideAprun {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_run_mpi(&self) -> bool {
        false
    }

    fn openmp(&self, spec: RankSpec, threads: usize) -> Result<RankSpec, Error> {
        if threads != 1 {
            return Err(Error::OpenMpDisabled(NAME.to_string(), threads));
        }
        Ok(annotate_openmp(spec, &basic_openmp_env(1), 1))
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        let any_serial = validate_classification(spec)?;
        if any_serial && spec.nranks() == 1 && !options.allranks {
            if let Some((program, _)) = spec.expand_iter(true).next() {
                debug!("Running '{}' directly under aprun.", program.executable());
                return Ok(direct_command(program));
            }
        }
        Err(Error::MpiDisabled(NAME.to_string()))
    }

    // The enclosing aprun owns the filesystem sync.
    fn runsync(&self) {}
}
