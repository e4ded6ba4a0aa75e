use log::debug;
use std::path::PathBuf;

use super::{
    basic_openmp_env, compile_colon, find_in_path, launcher_path, Backend, ColonParams,
    LaunchOptions, SerialResolver,
};
use crate::command::Command;
use crate::config::BackendSettings;
use crate::rankspec::RankSpec;
use crate::Error;

pub(crate) const NAME: &str = "mpich";
const DEFAULT_LAUNCHER: &str = "mpiexec";

/// MPICH and compatible stacks, launched through `mpiexec`.
///
/// Probed after `impi` so Intel installations do not match here.
pub struct Mpich {
    launcher: PathBuf,
    mpiserial: SerialResolver,
    total_tasks: Option<usize>,
}

impl Mpich {
    /// Match when `mpiexec` is on `$PATH`.
    pub fn probe(settings: &BackendSettings) -> Option<Self> {
        let launcher = launcher_path(settings, DEFAULT_LAUNCHER);
        let found = find_in_path(launcher.to_str()?)?;
        debug!("Found MPICH launcher '{}'.", found.display());
        Some(Self::force(settings))
    }

    /// Construct without probing the environment.
    pub fn force(settings: &BackendSettings) -> Self {
        Mpich {
            launcher: launcher_path(settings, DEFAULT_LAUNCHER),
            mpiserial: SerialResolver::new(settings.mpiserial.clone()),
            total_tasks: settings.total_tasks,
        }
    }
}

impl Backend for Mpich {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        compile_colon(
            &ColonParams {
                backend: NAME,
                launcher: &self.launcher,
                np_flag: "-np",
                label_flags: &["-l"],
                serial_env: &[],
                openmp_env: basic_openmp_env,
            },
            spec,
            options,
            &self.mpiserial,
            self.total_tasks,
        )
    }
}

#[cfg(test)]
mod tests {
    use serial_test::parallel;

    use super::*;
    use crate::rankspec::Program;

    fn setup() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    #[test]
    #[parallel]
    fn mpmd_colon_syntax() {
        setup();
        let backend = Mpich::force(&BackendSettings::default());
        let spec = RankSpec::from(Program::new("atmos"))
            .replicate(6)
            .then(RankSpec::from(Program::new("ocean").arg("-v")).replicate(2));

        let command = backend
            .mpirunner(&spec, &LaunchOptions::default())
            .expect("compiles");

        let expected: Vec<String> = [
            "mpiexec", "-np", "6", "atmos", ":", "-np", "2", "ocean", "-v",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(command.argv(), expected.as_slice());
    }

    #[test]
    #[parallel]
    fn launcher_override() {
        setup();
        let settings = BackendSettings {
            launcher: Some(PathBuf::from("/opt/mpich/bin/mpiexec")),
            ..BackendSettings::default()
        };
        let backend = Mpich::force(&settings);
        let command = backend
            .mpirunner(
                &RankSpec::from(Program::new("model")).replicate(3),
                &LaunchOptions::default(),
            )
            .expect("compiles");
        assert_eq!(command.argv()[0], "/opt/mpich/bin/mpiexec");
    }

    #[test]
    #[parallel]
    fn serial_tree_uses_mpiserial() {
        setup();
        let settings = BackendSettings {
            mpiserial: Some(PathBuf::from("/opt/bin/mpiserial")),
            ..BackendSettings::default()
        };
        let backend = Mpich::force(&settings);
        let spec = RankSpec::from(Program::serial("ls").arg("-l"))
            .then(Program::serial("du").arg("-h"));

        let command = backend
            .mpirunner(&spec, &LaunchOptions::default())
            .expect("compiles");

        assert_eq!(
            command.argv(),
            &["mpiexec", "-np", "2", "/opt/bin/mpiserial"]
        );
        let file = command.get_command_file().expect("serial command file");
        assert_eq!(file.lines(), &["ls -l", "du -h"]);
    }
}
