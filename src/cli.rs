pub mod backend;
pub mod render;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, subcommand_required = true)]
pub struct Options {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOptions {
    /// Use the given MPI backend.
    ///
    /// Autodetected by default.
    #[arg(long, global = true, env = "RANKRUN_BACKEND", display_order = 2)]
    pub backend: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ShowCommands {
    /// Show the MPI backend.
    ///
    /// `rankrun show backend` prints the name and effective settings of
    /// the backend that matches the current environment, in TOML format.
    ///
    /// EXAMPLES
    ///
    /// * Show the autodetected backend:
    ///
    ///   rankrun show backend
    ///
    /// * Show a specific backend:
    ///
    ///   rankrun show backend --backend=impi
    ///
    /// * List all known backends and whether each one matches:
    ///
    ///   rankrun show backend --all
    ///
    Backend(backend::Arguments),
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show properties of the launch environment.
    #[command(subcommand)]
    Show(ShowCommands),

    /// Compile a rank specification into a shell command.
    ///
    /// `rankrun render` builds a rank tree from colon-separated groups of
    /// `COUNT EXECUTABLE [ARGS...]` and prints the compiled command as
    /// shell text, including any command file the backend would write.
    /// Nothing is executed and no files are created.
    ///
    /// EXAMPLES
    ///
    /// * Render an MPMD run of two programs:
    ///
    ///   rankrun render 140 ./atmos : 50 ./ocean
    ///
    /// * Render a serial batch under mpiserial:
    ///
    ///   rankrun render --serial 10 ls -l
    ///
    /// * Render eight ranks with four OpenMP threads each:
    ///
    ///   rankrun render --threads=4 8 ./model
    ///
    Render(render::Arguments),
}
