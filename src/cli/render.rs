use clap::Args;
use log::debug;
use std::error::Error;
use std::io::Write;

use crate::cli::GlobalOptions;
use rankrun::backend::{self, LaunchOptions};
use rankrun::config::Configuration;
use rankrun::rankspec::{Program, RankSpec};

#[derive(Args, Debug)]
pub struct Arguments {
    /// Mark every rank as a serial (non-MPI) program.
    #[arg(long, display_order = 0)]
    serial: bool,

    /// Spread a single-rank group over every available task slot.
    #[arg(long, display_order = 0)]
    allranks: bool,

    /// Label each rank's output where the backend supports it.
    #[arg(long, display_order = 0)]
    label_io: bool,

    /// Set this OpenMP thread count on every rank.
    #[arg(long, value_name = "N", display_order = 0)]
    threads: Option<usize>,

    /// Total task slots available to --allranks.
    #[arg(long, value_name = "N", display_order = 0)]
    total_tasks: Option<usize>,

    /// Rank groups: `COUNT EXECUTABLE [ARGS...]`, separated by `:`.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "GROUPS"
    )]
    groups: Vec<String>,
}

/// Build a rank tree from the command line group syntax.
fn parse_groups(words: &[String], serial: bool) -> Result<RankSpec, Box<dyn Error>> {
    let mut spec: Option<RankSpec> = None;

    for group in words.split(|word| word.as_str() == ":") {
        let [count, executable, args @ ..] = group else {
            return Err(format!(
                "Expected 'COUNT EXECUTABLE [ARGS...]', got '{}'.",
                group.join(" ")
            )
            .into());
        };
        let count: usize = count
            .parse()
            .map_err(|_| format!("Invalid rank count '{count}'."))?;

        let program = if serial {
            Program::serial(executable)
        } else {
            Program::new(executable)
        }
        .args(args.iter().cloned());

        let node = RankSpec::from(program).replicate(count);
        spec = Some(match spec {
            None => node,
            Some(spec) => spec.then(node),
        });
    }

    spec.ok_or_else(|| "Expected at least one rank group.".into())
}

/// Render a rank specification.
///
/// Print the compiled command as shell text to stdout.
///
pub fn render<W: Write>(
    options: &GlobalOptions,
    args: &Arguments,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    debug!("Rendering a rank specification.");

    let configuration = Configuration::open()?;
    let backend = match &options.backend {
        Some(name) => backend::by_name(name, &configuration)?,
        None => backend::detect(&configuration),
    };

    let mut spec = parse_groups(&args.groups, args.serial)?;
    if let Some(threads) = args.threads {
        spec = backend.openmp(spec, threads)?;
    }

    let launch = LaunchOptions {
        allranks: args.allranks,
        label_io: args.label_io,
        total_tasks: args.total_tasks,
        ..LaunchOptions::default()
    };
    let command = backend.mpirunner(&spec, &launch)?;

    write!(output, "{}", command.to_shell())?;
    Ok(())
}
