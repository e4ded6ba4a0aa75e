#![warn(clippy::pedantic)]

use clap::Parser;
use log::error;
use std::error::Error;
use std::io::{self, Write};
use std::process::ExitCode;

mod cli;

use cli::{Commands, Options, ShowCommands};

fn main_detail() -> Result<(), Box<dyn Error>> {
    let options = Options::parse();

    let log_level = match options.verbose.log_level_filter() {
        clap_verbosity_flag::LevelFilter::Off => "off",
        clap_verbosity_flag::LevelFilter::Error => "error",
        clap_verbosity_flag::LevelFilter::Warn => "warn",
        clap_verbosity_flag::LevelFilter::Info => "info",
        clap_verbosity_flag::LevelFilter::Debug => "debug",
        clap_verbosity_flag::LevelFilter::Trace => "trace",
    };

    let env = env_logger::Env::default()
        .filter_or("RANKRUN_LOG", log_level)
        .write_style("RANKRUN_LOG_STYLE");

    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .init();

    let mut output = io::stdout();

    match options.command {
        Some(Commands::Show(show)) => match show {
            ShowCommands::Backend(args) => {
                cli::backend::backend(&options.global, &args, &mut output)?;
            }
        },
        Some(Commands::Render(args)) => {
            cli::render::render(&options.global, &args, &mut output)?;
        }
        None => (),
    }

    output.flush()?;

    Ok(())
}

fn main() -> ExitCode {
    if let Err(error) = main_detail() {
        error!("{error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
