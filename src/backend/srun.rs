use log::debug;
use std::env;
use std::path::PathBuf;

use super::{
    apply_threads, basic_openmp_env, find_in_path, launcher_path, resolve_node_size,
    resolve_total_tasks, validate_classification, Backend, LaunchOptions, SerialResolver,
};
use crate::cmdfile::CommandFile;
use crate::command::Command;
use crate::config::BackendSettings;
use crate::nodes::{self, RankGroup};
use crate::rankspec::{RankSpec, Setting};
use crate::{Error, SERIAL_COMMAND_FILE_VARIABLE};

pub(crate) const NAME: &str = "srun";
const DEFAULT_LAUNCHER: &str = "srun";
const DEFAULT_SCONTROL: &str = "scontrol";

/// SLURM, launched through `srun`.
///
/// Heterogeneous runs use `--multi-prog` with one command-file line per
/// contiguous rank range. When the live node list is available the
/// compiler also pins ranks to hosts with `--distribution=arbitrary` so
/// that per-group thread counts are respected when packing ranks onto
/// fixed-size nodes.
///
pub struct Srun {
    launcher: PathBuf,
    scontrol: PathBuf,
    mpiserial: SerialResolver,
    total_tasks: Option<usize>,
    nodesize: Option<usize>,
}

impl Srun {
    /// Match inside a SLURM allocation with `srun` available.
    pub fn probe(settings: &BackendSettings) -> Option<Self> {
        env::var_os("SLURM_NODELIST")?;
        let launcher = launcher_path(settings, DEFAULT_LAUNCHER);
        find_in_path(launcher.to_str()?)?;
        debug!("Found SLURM allocation with '{}'.", launcher.display());
        Some(Self::force(settings))
    }

    /// Construct without probing the environment.
    pub fn force(settings: &BackendSettings) -> Self {
        Srun {
            launcher: launcher_path(settings, DEFAULT_LAUNCHER),
            scontrol: settings
                .scontrol
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCONTROL)),
            mpiserial: SerialResolver::new(settings.mpiserial.clone()),
            total_tasks: settings.total_tasks,
            nodesize: settings.nodesize,
        }
    }

    /// Compute a host-per-rank node assignment for an MPMD run.
    ///
    /// Returns `Ok(None)` outside an allocation or when the node size is
    /// unknown; the run then uses SLURM's default distribution.
    fn node_assignment(
        &self,
        spec: &RankSpec,
        options: &LaunchOptions,
    ) -> Result<Option<Vec<String>>, Error> {
        let Some(hosts) = nodes::live_hostnames(&self.scontrol)? else {
            debug!("No SLURM node list; using the default distribution.");
            return Ok(None);
        };

        let nodesize = match resolve_node_size(options, self.nodesize) {
            Some(nodesize) => nodesize,
            None => match env::var("SLURM_JOB_CPUS_PER_NODE") {
                Ok(value) => match nodes::cpus_per_node(&value)?.into_iter().min() {
                    Some(smallest) => smallest,
                    None => return Ok(None),
                },
                Err(_) => {
                    debug!("Node size unknown; using the default distribution.");
                    return Ok(None);
                }
            },
        };

        let groups: Vec<RankGroup> = spec
            .expand_iter(false)
            .map(|(program, count)| RankGroup {
                count,
                threads: program.thread_count(),
                ranks_per_node: program.node_ranks().or(options.ranks_per_node),
            })
            .collect();

        nodes::pack_ranks(&groups, &hosts, nodesize).map(Some)
    }
}

impl Backend for Srun {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        let any_serial = validate_classification(spec)?;

        let nranks = spec.nranks();
        if options.allranks && nranks > 1 {
            return Err(Error::MpiAllRanks(nranks));
        }
        if !matches!(spec.mixed_local_opts(), Setting::Unset) {
            return Err(Error::MpiLocalOptsMixed(NAME.to_string()));
        }

        let launcher = self
            .launcher
            .to_str()
            .ok_or_else(|| Error::NonUTF8Path(self.launcher.clone()))?;
        let mut pre: Vec<&str> = vec![launcher];
        if options.label_io {
            pre.push("--label");
        }

        let command = if any_serial {
            let serial_path = self.mpiserial.resolve()?;
            let serial = serial_path
                .to_str()
                .ok_or_else(|| Error::NonUTF8Path(serial_path.clone()))?;

            let mut lines = spec.collapse().to_arglist(&[], &[], &[], true, true);
            let ntasks = if options.allranks {
                let total = resolve_total_tasks(options, self.total_tasks)?;
                lines = vec![lines[0].clone(); total];
                total
            } else {
                nranks
            };

            debug!("Compiling srun serial run of {ntasks} ranks under mpiserial.");
            Command::new(pre)
                .arg(format!("--ntasks={ntasks}"))
                .arg(serial)
                .command_file(CommandFile::new(
                    "serialcmdf",
                    lines,
                    SERIAL_COMMAND_FILE_VARIABLE,
                ))
        } else if spec.expand_iter(false).count() > 1 {
            let lines = spec
                .collapse()
                .to_arglist(&[], &["{first}-{last}"], &[], true, false);
            debug!(
                "Compiling srun MPMD run of {nranks} ranks in {} ranges.",
                lines.len()
            );

            let mut command = Command::new(pre).arg(format!("--ntasks={nranks}"));
            if let Some(assignment) = self.node_assignment(spec, options)? {
                command = command
                    .arg("--distribution=arbitrary")
                    .arg(format!("--nodelist={}", assignment.join(",")));
            }
            command.command_file(
                CommandFile::new("multiprog", lines, SERIAL_COMMAND_FILE_VARIABLE)
                    .filename_arg(Some("--multi-prog")),
            )
        } else {
            let ntasks = if options.allranks {
                resolve_total_tasks(options, self.total_tasks)?
            } else {
                nranks
            };
            debug!("Compiling srun run of {ntasks} ranks.");
            let before = format!("--ntasks={ntasks}");
            Command::new(spec.to_arglist(&pre, &[before.as_str()], &[], false, false))
        };

        Ok(apply_threads(command, spec, basic_openmp_env))
    }
}
