pub mod backend;
pub(crate) mod builtin;
pub mod cmdfile;
pub mod command;
pub mod config;
pub mod nodes;
pub mod rankspec;

use std::io;
use std::path::PathBuf;

/// Name of the environment variable that tracks nested `aprun` launches.
pub const INSIDE_APRUN_VARIABLE: &str = "INSIDE_APRUN";

/// Default environment variable that points `mpiserial` at its command file.
pub const SERIAL_COMMAND_FILE_VARIABLE: &str = "SCR_CMDFILE";

/// Errors that may be encountered when using the rankrun crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // IO errors
    #[error("I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("No home directory")]
    NoHome(),

    #[error("Unable to read '{0}': {1}")]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Unable to write '{0}': {1}")]
    FileWrite(PathBuf, #[source] io::Error),

    #[error("Unable to spawn '{0}': {1}.")]
    SpawnProcess(String, #[source] io::Error),

    #[error("Unexpected output from {0}: {1}")]
    UnexpectedOutput(String, String),

    #[error("Non-UTF-8 path '{0}'")]
    NonUTF8Path(PathBuf),

    // serialization errors
    #[error("Unable to parse '{0}'.\n{1}")]
    TOMLParse(PathBuf, #[source] toml::de::Error),

    // rank topology errors
    #[error("Serial and parallel ranks combined in one specification.")]
    MpiMixed,

    #[error("Backend '{0}' cannot express per-rank thread counts.")]
    MpiThreadsMixed(String),

    #[error("Backend '{0}' cannot express per-rank launcher options.")]
    MpiLocalOptsMixed(String),

    #[error("Requested all ranks for a specification that already has {0} ranks.")]
    MpiAllRanks(usize),

    #[error("Requested {requested} ranks but the allocation only fits {available}.")]
    MpiTooManyRanks { requested: usize, available: usize },

    #[error("The mpiserial helper program is not available.")]
    MpiSerialMissing,

    #[error("Backend '{0}' cannot run MPI programs.")]
    MpiDisabled(String),

    #[error("Backend '{0}' cannot run OpenMP programs with {1} threads.")]
    OpenMpDisabled(String, usize),

    // configuration errors
    #[error("Backend '{0}' not found: execute 'rankrun show backend --all' to see known backends.")]
    BackendNameNotFound(String),

    #[error("Total task count is not known: set total_tasks or export TOTAL_TASKS.")]
    TotalTasksUnknown,

    #[error("Empty rank specification.")]
    EmptySpec,
}
