use log::{debug, trace};
use path_absolutize::Absolutize;
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::rankspec::quote;
use crate::Error;

/// An MPMD command-file generator.
///
/// Several launchers consume a text file with one line per rank or rank
/// range instead of (or in addition to) argv. `CommandFile` holds the
/// rendered lines and knows which environment variable the launcher
/// expects the file's path under. It is short-lived: one instance per
/// compiled command.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandFile {
    kind: String,
    lines: Vec<String>,
    env_var: String,
    model_var: Option<(String, String)>,
    filename: Option<PathBuf>,
    filename_arg: bool,
    filename_flag: Option<String>,
}

impl CommandFile {
    /// Construct a generator for the given logical kind.
    ///
    /// `kind` derives the default temporary file name. `env_var` is the
    /// environment variable the launcher reads the file path from.
    ///
    pub fn new(
        kind: impl Into<String>,
        lines: Vec<String>,
        env_var: impl Into<String>,
    ) -> Self {
        CommandFile {
            kind: kind.into(),
            lines,
            env_var: env_var.into(),
            model_var: None,
            filename: None,
            filename_arg: false,
            filename_flag: None,
        }
    }

    /// Also force a second environment variable to a fixed value.
    ///
    /// Used to flag MPMD mode (`MP_PGMMODEL=MPMD`).
    #[must_use]
    pub fn model_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.model_var = Some((name.into(), value.into()));
        self
    }

    /// Write to this exact file instead of a temporary one.
    #[must_use]
    pub fn filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.filename = Some(path.into());
        self
    }

    /// Append the file path to argv, optionally preceded by a flag.
    #[must_use]
    pub fn filename_arg(mut self, flag: Option<&str>) -> Self {
        self.filename_arg = true;
        self.filename_flag = flag.map(ToString::to_string);
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    /// The path used when rendering shell text without touching the
    /// filesystem.
    fn shell_path(&self) -> String {
        match &self.filename {
            Some(path) => path.display().to_string(),
            None => format!("{}.cmdf", self.kind),
        }
    }

    /// Write the command file and bind it into `argv`/`env`.
    ///
    /// Writes either the explicit filename or a uniquely named, mode 0440
    /// temporary file in `directory`. The environment variable receives
    /// the file's absolute path.
    ///
    /// # Errors
    /// `Err(Error::FileWrite)` when the file cannot be created.
    ///
    pub(crate) fn write_into(
        &self,
        argv: &mut Vec<String>,
        env: &mut Vec<(String, String)>,
        directory: &Path,
    ) -> Result<PathBuf, Error> {
        let path = match &self.filename {
            Some(path) => path.clone(),
            None => directory.join(format!("{}.{}.cmdf", self.kind, Uuid::new_v4())),
        };

        let mut body = String::with_capacity(self.lines.iter().map(String::len).sum::<usize>() + self.lines.len());
        for line in &self.lines {
            body.push_str(line);
            body.push('\n');
        }

        debug!("Writing {} command file '{}'.", self.kind, path.display());
        fs::write(&path, body).map_err(|e| Error::FileWrite(path.clone(), e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o440))
            .map_err(|e| Error::FileWrite(path.clone(), e))?;

        let absolute = path
            .absolutize()
            .map_err(|e| Error::FileWrite(path.clone(), e))?
            .to_path_buf();
        let absolute_str = absolute
            .to_str()
            .ok_or_else(|| Error::NonUTF8Path(absolute.clone()))?;

        trace!("Binding {}={absolute_str}.", self.env_var);
        env.push((self.env_var.clone(), absolute_str.to_string()));
        if let Some((name, value)) = &self.model_var {
            env.push((name.clone(), value.clone()));
        }

        if self.filename_arg {
            if let Some(flag) = &self.filename_flag {
                argv.push(flag.clone());
            }
            argv.push(absolute_str.to_string());
        }

        Ok(absolute)
    }

    /// Render the equivalent bash fragment for dry runs.
    ///
    /// Produces a `cat` truncation followed by `echo` appends. Runs of
    /// identical lines collapse into a counted `for` loop.
    ///
    pub fn to_shell(&self) -> String {
        let path = quote(&self.shell_path());
        let mut result = format!("cat /dev/null > {path}\n");

        let mut index = 0;
        while index < self.lines.len() {
            let line = &self.lines[index];
            let mut run = 1;
            while index + run < self.lines.len() && self.lines[index + run] == *line {
                run += 1;
            }

            let quoted = quote(line);
            if run == 1 {
                let _ = writeln!(result, "echo {quoted} >> {path}");
            } else {
                let _ = writeln!(
                    result,
                    "for _ in $(seq 1 {run}) ; do echo {quoted} >> {path} ; done"
                );
            }
            index += run;
        }

        let _ = writeln!(result, "export {}={path}", self.env_var);
        if let Some((name, value)) = &self.model_var {
            let _ = writeln!(result, "export {}={}", name, quote(value));
        }

        result
    }
}
