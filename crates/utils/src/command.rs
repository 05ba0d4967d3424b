//! Helpers for running external tools.

use std::fmt;
use std::process::{Output, Stdio};

/// How many trailing lines of stderr we keep from a failed command.
pub const STDERR_TAIL_LINES: usize = 10;

/// An external command that could not be run, or exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// The program that was executed.
    pub program: String,
    /// The exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// The last lines of the process error stream.
    pub stderr_tail: String,
}

impl CommandFailure {
    /// A process which ran and exited unsuccessfully.
    pub fn new(program: impl Into<String>, exit_code: Option<i32>, stderr: &[u8]) -> Self {
        Self {
            program: program.into(),
            exit_code,
            stderr_tail: stderr_tail(stderr, STDERR_TAIL_LINES),
        }
    }

    /// A process which could not be spawned or waited for.
    pub fn spawn(program: impl Into<String>, err: &std::io::Error) -> Self {
        Self {
            program: program.into(),
            exit_code: None,
            stderr_tail: err.to_string(),
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} exited with code {code}", self.program)?,
            None => write!(f, "{} failed", self.program)?,
        }
        if !self.stderr_tail.is_empty() {
            write!(f, ": {}", self.stderr_tail)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailure {}

/// Return the last `lines` non-empty lines of `stderr`, lossily decoded.
pub fn stderr_tail(stderr: &[u8], lines: usize) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let all: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Render the command line in a form suitable for copy-pasting into a shell.
    fn to_string_pretty(&self) -> String;
}

impl CommandRunExt for std::process::Command {
    fn to_string_pretty(&self) -> String {
        let mut words = Vec::new();
        for arg in std::iter::once(self.get_program()).chain(self.get_args()) {
            let arg = arg.to_string_lossy();
            let quoted = match shlex::try_quote(&arg) {
                Ok(q) => q.into_owned(),
                Err(_) => format!("{arg:?}"),
            };
            words.push(quoted);
        }
        words.join(" ")
    }
}

/// Helpers intended for [`tokio::process::Command`].
#[allow(async_fn_in_trait)]
pub trait AsyncCommandRunExt {
    /// Run the command to completion, capturing stderr (and stdout if it was
    /// configured as piped). The child is killed if the returned future is
    /// dropped before it completes.
    ///
    /// A non-zero exit is turned into a [`CommandFailure`] carrying the tail
    /// of stderr.
    async fn run_capture_tail(&mut self) -> Result<Output, CommandFailure>;
}

impl AsyncCommandRunExt for tokio::process::Command {
    async fn run_capture_tail(&mut self) -> Result<Output, CommandFailure> {
        let program = self.as_std().get_program().to_string_lossy().into_owned();
        tracing::debug!("exec: {}", self.as_std().to_string_pretty());
        self.stderr(Stdio::piped()).kill_on_drop(true);
        let child = self
            .spawn()
            .map_err(|e| CommandFailure::spawn(program.as_str(), &e))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CommandFailure::spawn(program.as_str(), &e))?;
        if !output.status.success() {
            return Err(CommandFailure::new(
                program,
                output.status.code(),
                &output.stderr,
            ));
        }
        Ok(output)
    }
}
