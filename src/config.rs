use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use crate::backend::DETECTION_ORDER;
use crate::builtin::BuiltIn;
use crate::Error;

/// Backend configuration
///
/// `Configuration` stores the per-backend overrides read from
/// `backends.toml`, merged over the built-in defaults.
///
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Pin backend selection to this backend, skipping detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) force: Option<String>,

    /// The per-backend settings.
    #[serde(default)]
    pub(crate) backend: HashMap<String, BackendSettings>,
}

/// Settings for one backend.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    /// Path (or bare name searched in `$PATH`) of the launcher binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher: Option<PathBuf>,

    /// Path to the `mpiserial` helper program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpiserial: Option<PathBuf>,

    /// Path to `scontrol` (SLURM only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scontrol: Option<PathBuf>,

    /// Task slots per node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodesize: Option<usize>,

    /// Total available task slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<usize>,

    /// CPU frequency (kHz) used for turbo-mode ranks (aprun only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_state_turbo: Option<u64>,
}

impl BackendSettings {
    /// Overlay `self` on top of `defaults`, field by field.
    fn over(&self, defaults: &BackendSettings) -> BackendSettings {
        BackendSettings {
            launcher: self.launcher.clone().or_else(|| defaults.launcher.clone()),
            mpiserial: self
                .mpiserial
                .clone()
                .or_else(|| defaults.mpiserial.clone()),
            scontrol: self.scontrol.clone().or_else(|| defaults.scontrol.clone()),
            nodesize: self.nodesize.or(defaults.nodesize),
            total_tasks: self.total_tasks.or(defaults.total_tasks),
            p_state_turbo: self.p_state_turbo.or(defaults.p_state_turbo),
        }
    }
}

impl Configuration {
    /// Open the backend configuration
    ///
    /// Open `$HOME/.config/rankrun/backends.toml` if it exists and merge
    /// it with the built-in configuration.
    ///
    /// # Errors
    /// Returns `Err(rankrun::Error)` when the file cannot be read or if
    /// there is a parse error.
    ///
    pub fn open() -> Result<Self, Error> {
        let home = match env::var("RANKRUN_HOME") {
            Ok(rankrun_home) => PathBuf::from(rankrun_home),
            Err(_) => home::home_dir().ok_or_else(Error::NoHome)?,
        };
        let backends_toml_path = home.join(".config").join("rankrun").join("backends.toml");
        Self::open_from_path(backends_toml_path)
    }

    pub(crate) fn open_from_path(backends_toml_path: PathBuf) -> Result<Self, Error> {
        let mut configuration = Self::built_in();

        let backends_file = match File::open(&backends_toml_path) {
            Ok(file) => file,
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => {
                    trace!(
                        "'{}' does not exist, using built-in backend settings.",
                        &backends_toml_path.display()
                    );
                    return Ok(configuration);
                }
                _ => return Err(Error::FileRead(backends_toml_path, error)),
            },
        };

        let mut buffer = BufReader::new(backends_file);
        let mut backends_string = String::new();
        buffer
            .read_to_string(&mut backends_string)
            .map_err(|e| Error::FileRead(backends_toml_path.clone(), e))?;

        trace!("Parsing '{}'.", &backends_toml_path.display());
        let user_config = Self::parse_str(&backends_toml_path, &backends_string)?;
        configuration.merge(user_config);
        configuration.validate()?;
        Ok(configuration)
    }

    /// Parse a `Configuration` from a TOML string
    ///
    /// Does *NOT* merge with the built-in configuration.
    ///
    pub(crate) fn parse_str(path: &Path, toml: &str) -> Result<Self, Error> {
        toml::from_str(toml).map_err(|e| Error::TOMLParse(path.to_path_buf(), e))
    }

    /// Merge keys from another configuration into this one.
    ///
    /// Merging adds new keys from `b` into self. It also overrides any
    /// fields set in both with the value in `b`.
    ///
    fn merge(&mut self, b: Self) {
        if b.force.is_some() {
            self.force = b.force;
        }
        for (backend_name, settings) in b.backend {
            self.backend
                .entry(backend_name)
                .and_modify(|defaults| *defaults = settings.over(defaults))
                .or_insert(settings);
        }
    }

    /// Validate that the configuration only names known backends.
    fn validate(&self) -> Result<(), Error> {
        for name in self.backend.keys() {
            if !DETECTION_ORDER.contains(&name.as_str()) {
                return Err(Error::BackendNameNotFound(name.clone()));
            }
        }
        if let Some(force) = &self.force {
            if !DETECTION_ORDER.contains(&force.as_str()) {
                return Err(Error::BackendNameNotFound(force.clone()));
            }
        }

        Ok(())
    }

    /// The forced backend name, if any.
    pub fn force(&self) -> Option<&str> {
        self.force.as_deref()
    }

    /// The effective settings for a backend.
    pub fn settings(&self, backend_name: &str) -> BackendSettings {
        self.backend.get(backend_name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serial_test::parallel;

    use super::*;

    fn setup() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::max())
            .is_test(true)
            .try_init();
    }

    #[test]
    #[parallel]
    fn open_no_file() {
        setup();
        let temp = TempDir::new().unwrap().child("backends.toml");
        let configuration =
            Configuration::open_from_path(temp.path().into()).expect("valid configuration");
        assert_eq!(configuration, Configuration::built_in());
    }

    #[test]
    #[parallel]
    fn open_empty_file() {
        setup();
        let temp = TempDir::new().unwrap().child("backends.toml");
        temp.write_str("").unwrap();
        let configuration =
            Configuration::open_from_path(temp.path().into()).expect("valid configuration");
        assert_eq!(configuration, Configuration::built_in());
    }

    #[test]
    #[parallel]
    fn unknown_backend_rejected() {
        setup();
        let temp = TempDir::new().unwrap().child("backends.toml");
        temp.write_str(
            r"
[backend.not_a_backend]
",
        )
        .unwrap();
        let error = Configuration::open_from_path(temp.path().into());
        assert!(matches!(error, Err(Error::BackendNameNotFound(_))));
    }

    #[test]
    #[parallel]
    fn unknown_field_rejected() {
        setup();
        let temp = TempDir::new().unwrap().child("backends.toml");
        temp.write_str(
            r#"
[backend.impi]
not_a_field = "value"
"#,
        )
        .unwrap();
        let error = Configuration::open_from_path(temp.path().into());
        assert!(matches!(error, Err(Error::TOMLParse(_, _))));
    }

    #[test]
    #[parallel]
    fn overrides_merge_over_built_in() {
        setup();
        let temp = TempDir::new().unwrap().child("backends.toml");
        temp.write_str(
            r#"
force = "srun"

[backend.srun]
nodesize = 36
scontrol = "/opt/slurm/bin/scontrol"

[backend.impi]
launcher = "/opt/intel/bin/mpirun"
"#,
        )
        .unwrap();
        let configuration =
            Configuration::open_from_path(temp.path().into()).expect("valid configuration");

        assert_eq!(configuration.force(), Some("srun"));

        let srun = configuration.settings("srun");
        assert_eq!(srun.nodesize, Some(36));
        assert_eq!(srun.scontrol, Some(PathBuf::from("/opt/slurm/bin/scontrol")));
        // The built-in launcher name survives the merge.
        assert_eq!(srun.launcher, Some(PathBuf::from("srun")));

        let impi = configuration.settings("impi");
        assert_eq!(impi.launcher, Some(PathBuf::from("/opt/intel/bin/mpirun")));

        // Untouched backends keep their defaults.
        assert_eq!(
            configuration.settings("mpich").launcher,
            Some(PathBuf::from("mpiexec"))
        );
    }

    #[test]
    #[parallel]
    fn settings_for_unknown_backend_default() {
        setup();
        let configuration = Configuration::default();
        assert_eq!(configuration.settings("impi"), BackendSettings::default());
    }
}
