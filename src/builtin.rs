use std::collections::HashMap;
use std::path::PathBuf;

use crate::backend::{impi, inside_aprun, lsf, lsf_cray, mpich, mpt, srun};
use crate::config::{BackendSettings, Configuration};

pub(crate) trait BuiltIn {
    fn built_in() -> Self;
}

impl BuiltIn for Configuration {
    /// Construct the built-in backend settings.
    ///
    /// These name the canonical launcher binaries; sites override them
    /// in `backends.toml`.
    fn built_in() -> Self {
        let mut backend = HashMap::with_capacity(7);

        backend.insert(
            lsf_cray::NAME.into(),
            BackendSettings {
                launcher: Some(PathBuf::from("aprun")),
                ..BackendSettings::default()
            },
        );

        backend.insert(
            srun::NAME.into(),
            BackendSettings {
                launcher: Some(PathBuf::from("srun")),
                scontrol: Some(PathBuf::from("scontrol")),
                ..BackendSettings::default()
            },
        );

        backend.insert(
            inside_aprun::NAME.into(),
            BackendSettings::default(),
        );

        backend.insert(
            lsf::NAME.into(),
            BackendSettings {
                launcher: Some(PathBuf::from("mpirun.lsf")),
                ..BackendSettings::default()
            },
        );

        backend.insert(
            impi::NAME.into(),
            BackendSettings {
                launcher: Some(PathBuf::from("mpirun")),
                ..BackendSettings::default()
            },
        );

        backend.insert(
            mpt::NAME.into(),
            BackendSettings {
                launcher: Some(PathBuf::from("mpiexec_mpt")),
                ..BackendSettings::default()
            },
        );

        backend.insert(
            mpich::NAME.into(),
            BackendSettings {
                launcher: Some(PathBuf::from("mpiexec")),
                ..BackendSettings::default()
            },
        );

        Configuration {
            force: None,
            backend,
        }
    }
}
