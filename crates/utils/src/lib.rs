//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod command;
pub use command::*;
mod signal;
pub use signal::*;
mod tracing_util;
pub use tracing_util::*;

/// The name of our binary
pub const NAME: &str = "zerolayer";

/// Exit code for a generic failure.
pub const EXIT_FAILURE: i32 = 1;

/// Errors that know which process exit code they should produce.
pub trait ErrorExitCode {
    /// The exit code to use when this error terminates the process.
    fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

/// Intended for use in `main`, calls an inner function and
/// handles errors by printing them.
pub fn run_main<F, E>(f: F)
where
    F: FnOnce() -> Result<(), E>,
    E: std::fmt::Display + ErrorExitCode,
{
    use std::io::Write as _;

    use owo_colors::OwoColorize;

    if let Err(e) = f() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails.
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(e.exit_code());
    }
}
