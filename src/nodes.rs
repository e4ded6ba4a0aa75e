use log::{debug, trace};
use regex::Regex;
use std::env;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command as Process, Stdio};
use std::str;

use crate::Error;

/// One contiguous group of ranks with identical launch requirements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankGroup {
    pub count: usize,
    pub threads: Option<usize>,
    pub ranks_per_node: Option<usize>,
}

/// Expand the live SLURM node list.
///
/// Runs `scontrol show hostnames $SLURM_NODELIST` rather than trusting a
/// static node file.
///
/// # Returns
/// `Ok(None)` when `SLURM_NODELIST` is not set (not inside an
/// allocation).
///
/// # Errors
/// `Err(Error::SpawnProcess)` or `Err(Error::UnexpectedOutput)` when
/// `scontrol` cannot run or misbehaves.
///
pub fn live_hostnames(scontrol: &Path) -> Result<Option<Vec<String>>, Error> {
    let Ok(nodelist) = env::var("SLURM_NODELIST") else {
        trace!("SLURM_NODELIST is not set; no live node list.");
        return Ok(None);
    };

    debug!("Expanding node list '{nodelist}' with scontrol.");
    let output = Process::new(scontrol)
        .arg("show")
        .arg("hostnames")
        .arg(&nodelist)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .output()
        .map_err(|e| Error::SpawnProcess("scontrol".into(), e))?;

    if !output.status.success() {
        let message = match output.status.code() {
            None => match output.status.signal() {
                None => "scontrol was terminated by a unknown signal".to_string(),
                Some(signal) => format!("scontrol was terminated by signal {signal}"),
            },
            Some(code) => format!("scontrol exited with code {code}"),
        };
        return Err(Error::UnexpectedOutput("scontrol".into(), message));
    }

    let stdout = str::from_utf8(&output.stdout)
        .map_err(|_| Error::UnexpectedOutput("scontrol".into(), "non-UTF-8 output".into()))?;
    let hosts: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect();

    if hosts.is_empty() {
        return Err(Error::UnexpectedOutput(
            "scontrol".into(),
            "empty host list".into(),
        ));
    }

    Ok(Some(hosts))
}

/// Parse the `SLURM_JOB_CPUS_PER_NODE` counted-group syntax.
///
/// `"36(x4),24"` expands to `[36, 36, 36, 36, 24]`.
///
/// # Errors
/// `Err(Error::UnexpectedOutput)` for malformed input.
///
pub fn cpus_per_node(value: &str) -> Result<Vec<usize>, Error> {
    let group = Regex::new(r"^(\d+)(?:\(x(\d+)\))?$").expect("valid regular expression");
    let mut result = Vec::new();

    for part in value.split(',') {
        let captures = group.captures(part.trim()).ok_or_else(|| {
            Error::UnexpectedOutput("SLURM_JOB_CPUS_PER_NODE".into(), value.into())
        })?;
        let cpus: usize = captures[1]
            .parse()
            .map_err(|_| Error::UnexpectedOutput("SLURM_JOB_CPUS_PER_NODE".into(), value.into()))?;
        let repeat: usize = match captures.get(2) {
            Some(m) => m.as_str().parse().map_err(|_| {
                Error::UnexpectedOutput("SLURM_JOB_CPUS_PER_NODE".into(), value.into())
            })?,
            None => 1,
        };
        result.extend(std::iter::repeat(cpus).take(repeat));
    }

    Ok(result)
}

/// Assign one host per rank, packing rank groups onto fixed-size nodes.
///
/// Every group starts on a fresh node. A group's ranks occupy
/// `nodesize / threads` slots per node, further limited by the group's
/// own `ranks_per_node`.
///
/// # Errors
/// `Err(Error::MpiTooManyRanks)` when the groups do not fit on the given
/// hosts.
///
pub fn pack_ranks(
    groups: &[RankGroup],
    hosts: &[String],
    nodesize: usize,
) -> Result<Vec<String>, Error> {
    let requested: usize = groups.iter().map(|group| group.count).sum();
    let mut assignment = Vec::with_capacity(requested);
    let mut host_index = 0;

    for group in groups {
        let threads = group.threads.unwrap_or(1).max(1);
        let per_node = (nodesize / threads).min(group.ranks_per_node.unwrap_or(usize::MAX));
        if per_node == 0 {
            return Err(Error::MpiTooManyRanks {
                requested,
                available: 0,
            });
        }

        let mut remaining = group.count;
        while remaining > 0 {
            if host_index >= hosts.len() {
                return Err(Error::MpiTooManyRanks {
                    requested,
                    available: assignment.len(),
                });
            }
            let take = remaining.min(per_node);
            assignment.extend(std::iter::repeat(hosts[host_index].clone()).take(take));
            remaining -= take;
            host_index += 1;
        }
    }

    Ok(assignment)
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

    fn hosts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node{i:02}")).collect()
    }

    #[test]
    #[parallel]
    fn cpus_per_node_groups() {
        setup();
        assert_eq!(cpus_per_node("36").unwrap(), vec![36]);
        assert_eq!(cpus_per_node("36(x4)").unwrap(), vec![36, 36, 36, 36]);
        assert_eq!(cpus_per_node("36(x2),24").unwrap(), vec![36, 36, 24]);
        assert!(matches!(
            cpus_per_node("garbage"),
            Err(Error::UnexpectedOutput(_, _))
        ));
    }

    #[test]
    #[parallel]
    fn pack_single_group() {
        setup();
        let groups = [RankGroup {
            count: 5,
            threads: None,
            ranks_per_node: None,
        }];
        let assignment = pack_ranks(&groups, &hosts(2), 4).unwrap();
        assert_eq!(
            assignment,
            vec!["node00", "node00", "node00", "node00", "node01"]
        );
    }

    #[test]
    #[parallel]
    fn pack_respects_threads() {
        setup();
        // Two threads per rank halve the slots per node.
        let groups = [RankGroup {
            count: 4,
            threads: Some(2),
            ranks_per_node: None,
        }];
        let assignment = pack_ranks(&groups, &hosts(2), 4).unwrap();
        assert_eq!(assignment, vec!["node00", "node00", "node01", "node01"]);
    }

    #[test]
    #[parallel]
    fn pack_groups_start_on_fresh_nodes() {
        setup();
        let groups = [
            RankGroup {
                count: 2,
                threads: None,
                ranks_per_node: None,
            },
            RankGroup {
                count: 2,
                threads: None,
                ranks_per_node: None,
            },
        ];
        let assignment = pack_ranks(&groups, &hosts(2), 4).unwrap();
        assert_eq!(assignment, vec!["node00", "node00", "node01", "node01"]);
    }

    #[test]
    #[parallel]
    fn pack_respects_ranks_per_node() {
        setup();
        let groups = [RankGroup {
            count: 4,
            threads: None,
            ranks_per_node: Some(1),
        }];
        let assignment = pack_ranks(&groups, &hosts(4), 36).unwrap();
        assert_eq!(assignment, vec!["node00", "node01", "node02", "node03"]);
    }

    #[test]
    #[parallel]
    fn pack_overflow() {
        setup();
        let groups = [RankGroup {
            count: 9,
            threads: None,
            ranks_per_node: None,
        }];
        assert!(matches!(
            pack_ranks(&groups, &hosts(2), 4),
            Err(Error::MpiTooManyRanks {
                requested: 9,
                available: 8
            })
        ));

        let groups = [RankGroup {
            count: 1,
            threads: Some(8),
            ranks_per_node: None,
        }];
        assert!(matches!(
            pack_ranks(&groups, &hosts(2), 4),
            Err(Error::MpiTooManyRanks { available: 0, .. })
        ));
    }
}
