use log::trace;
use std::env;
use std::path::Path;

use crate::cmdfile::CommandFile;
use crate::rankspec::quote;
use crate::Error;

/// A compiled, runnable command.
///
/// `Command` is the output of a backend's `mpirunner`: an argv list,
/// environment assignments, and optionally a [`CommandFile`] that must be
/// written before the process is spawned. The external process executor
/// calls [`Command::prepare`] first, then runs argv with the given
/// environment and surfaces the exit status unchanged.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    command_file: Option<CommandFile>,
}

impl Command {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            command_file: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Add an environment assignment.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Add several environment assignments.
    #[must_use]
    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    /// Attach the command file to write before execution.
    #[must_use]
    pub fn command_file(mut self, command_file: CommandFile) -> Self {
        self.command_file = Some(command_file);
        self
    }

    /// Increment a counter environment variable, reading the current
    /// value from the process environment.
    #[must_use]
    pub fn increment_env_counter(self, name: &str) -> Self {
        let current = env::var(name)
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        self.env(name, (current + 1).to_string())
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn get_command_file(&self) -> Option<&CommandFile> {
        self.command_file.as_ref()
    }

    /// Write the attached command file (if any) into `directory` and bind
    /// its path into this command's argv and environment.
    ///
    /// Must run exactly once, immediately before the command is handed to
    /// a process launcher.
    ///
    /// # Errors
    /// `Err(Error::FileWrite)` when the command file cannot be created.
    ///
    pub fn prepare(&mut self, directory: &Path) -> Result<(), Error> {
        if let Some(command_file) = self.command_file.take() {
            trace!("Preparing command file for '{}'.", self.program());
            command_file.write_into(&mut self.argv, &mut self.env, directory)?;
        }
        Ok(())
    }

    /// The program that will be executed.
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// Render the equivalent bash fragment without touching the
    /// filesystem.
    pub fn to_shell(&self) -> String {
        let mut result = String::with_capacity(256);

        if let Some(command_file) = &self.command_file {
            result.push_str(&command_file.to_shell());
        }

        for (name, value) in &self.env {
            result.push_str(name);
            result.push('=');
            result.push_str(&quote(value));
            result.push(' ');
        }

        let mut first = true;
        for arg in &self.argv {
            if !first {
                result.push(' ');
            }
            result.push_str(&quote(arg));
            first = false;
        }
        result.push('\n');

        result
    }
}
