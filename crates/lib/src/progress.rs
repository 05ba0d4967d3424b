//! User-facing progress output.

use std::fmt::Display;
use std::io::Write as _;

use owo_colors::OwoColorize;

/// Prints progress lines to stdout unless quiet; every line is also
/// recorded as a tracing event so it reaches the journal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    quiet: bool,
}

impl Progress {
    /// Create a new printer.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Whether non-error output is suppressed.
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Report an action being taken.
    pub fn step(&self, msg: impl Display) {
        tracing::info!("{msg}");
        self.print("[zerolayer]".cyan(), msg);
    }

    /// Report an action a dry run is skipping.
    pub fn planned(&self, msg: impl Display) {
        tracing::info!("dry-run: {msg}");
        self.print("[dry-run]".blue(), msg);
    }

    fn print(&self, prefix: impl Display, msg: impl Display) {
        if self.quiet {
            return;
        }
        let mut out = anstream::stdout();
        // Don't fail an operation over a closed stdout.
        let _ = writeln!(out, "{prefix} {msg}");
    }
}
