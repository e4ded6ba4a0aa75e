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

pub(crate) const NAME: &str = "mpt";
const DEFAULT_LAUNCHER: &str = "mpiexec_mpt";

/// HPE/SGI MPT, launched through `mpiexec_mpt`.
pub struct SgiMpt {
    launcher: PathBuf,
    mpiserial: SerialResolver,
    total_tasks: Option<usize>,
}

impl SgiMpt {
    /// Match when `mpiexec_mpt` is on `$PATH`.
    pub fn probe(settings: &BackendSettings) -> Option<Self> {
        let launcher = launcher_path(settings, DEFAULT_LAUNCHER);
        let found = find_in_path(launcher.to_str()?)?;
        debug!("Found MPT launcher '{}'.", found.display());
        Some(Self::force(settings))
    }

    /// Construct without probing the environment.
    pub fn force(settings: &BackendSettings) -> Self {
        SgiMpt {
            launcher: launcher_path(settings, DEFAULT_LAUNCHER),
            mpiserial: SerialResolver::new(settings.mpiserial.clone()),
            total_tasks: settings.total_tasks,
        }
    }
}

impl Backend for SgiMpt {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mpirunner(&self, spec: &RankSpec, options: &LaunchOptions) -> Result<Command, Error> {
        if options.label_io {
            debug!("mpiexec_mpt has no rank labeling flag; ignoring the request.");
        }
        compile_colon(
            &ColonParams {
                backend: NAME,
                launcher: &self.launcher,
                np_flag: "-np",
                label_flags: &[],
                // MPT refuses to run non-MPI programs without this.
                serial_env: &[("MPI_SHEPHERD", "true")],
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
    fn serial_runs_set_the_shepherd_variable() {
        setup();
        let settings = BackendSettings {
            mpiserial: Some(PathBuf::from("/opt/bin/mpiserial")),
            ..BackendSettings::default()
        };
        let backend = SgiMpt::force(&settings);
        let spec = RankSpec::from(Program::serial("ls").arg("-l")).replicate(3);

        let command = backend
            .mpirunner(&spec, &LaunchOptions::default())
            .expect("compiles");

        assert_eq!(
            command.argv(),
            &["mpiexec_mpt", "-np", "3", "/opt/bin/mpiserial"]
        );
        assert!(command
            .environment()
            .contains(&("MPI_SHEPHERD".to_string(), "true".to_string())));
        let file = command.get_command_file().expect("serial command file");
        assert_eq!(file.lines(), &["ls -l"; 3]);
    }

    #[test]
    #[parallel]
    fn parallel_runs_do_not_set_the_shepherd_variable() {
        setup();
        let backend = SgiMpt::force(&BackendSettings::default());
        let command = backend
            .mpirunner(
                &RankSpec::from(Program::new("model")).replicate(8),
                &LaunchOptions::default(),
            )
            .expect("compiles");

        assert_eq!(command.argv(), &["mpiexec_mpt", "-np", "8", "model"]);
        assert!(command
            .environment()
            .iter()
            .all(|(name, _)| name != "MPI_SHEPHERD"));
    }

    #[test]
    #[parallel]
    fn label_request_is_ignored() {
        setup();
        let backend = SgiMpt::force(&BackendSettings::default());
        let options = LaunchOptions {
            label_io: true,
            ..LaunchOptions::default()
        };
        let command = backend
            .mpirunner(&RankSpec::from(Program::new("model")).replicate(2), &options)
            .expect("compiles");
        assert_eq!(command.argv(), &["mpiexec_mpt", "-np", "2", "model"]);
    }
}
