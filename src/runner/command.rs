use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use shell_escape::escape;

/// A program and its arguments, kept apart so nothing is re-split by a shell
/// unless the command is an explicit pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsCommand {
    program: String,
    args: Vec<String>,
}

impl OsCommand {
    pub fn new(program: impl Into<String>) -> Self {
        OsCommand {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Run `script` through bash with `pipefail`, so a pipeline exits with
    /// the status of its last failing stage. Callers quote interpolated
    /// values with [`quote`].
    pub fn pipeline(script: impl Into<String>) -> Self {
        OsCommand::new("/bin/bash")
            .args(["-o", "pipefail", "-c"])
            .arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

/// Shell-quoted rendering, stored as the process's command text.
impl fmt::Display for OsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

pub fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}
