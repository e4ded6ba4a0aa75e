use clap::Args;
use log::{debug, info};
use std::error::Error;
use std::io::Write;

use crate::cli::GlobalOptions;
use rankrun::backend::{self, DETECTION_ORDER};
use rankrun::config::Configuration;

#[derive(Args, Debug)]
pub struct Arguments {
    /// List all known backends and whether each one matches.
    #[arg(long, group = "select", display_order = 0)]
    all: bool,

    /// Show only the backend's name.
    #[arg(long, group = "select", display_order = 0)]
    name: bool,
}

/// Show the backend.
///
/// Print the backend's name and effective settings to stdout in toml
/// format.
///
pub fn backend<W: Write>(
    options: &GlobalOptions,
    args: &Arguments,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    debug!("Showing backends.");

    let configuration = Configuration::open()?;

    if args.all {
        info!("Backends in detection order:");
        for name in DETECTION_ORDER {
            let matched = backend::probe(name, &configuration).is_some();
            writeln!(output, "{name} = {matched}")?;
        }
        return Ok(());
    }

    let backend = match &options.backend {
        Some(name) => backend::by_name(name, &configuration)?,
        None => backend::detect(&configuration),
    };
    info!("Backend settings for '{}':", backend.name());

    if args.name {
        writeln!(output, "{}", backend.name())?;
    } else {
        writeln!(output, "name = \"{}\"", backend.name())?;
        writeln!(output, "can_run_mpi = {}", backend.can_run_mpi())?;
        write!(
            output,
            "{}",
            &toml::to_string_pretty(&configuration.settings(backend.name()))?
        )?;
    }

    Ok(())
}
