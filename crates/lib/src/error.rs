//! The error type returned by every zerolayer operation.

use camino::Utf8PathBuf;
use zerolayer_utils::{CommandFailure, ErrorExitCode};

/// Exit code for invalid requests: unknown or duplicate names, deleting
/// the active environment and similar.
pub const EXIT_VALIDATION: i32 = 2;

/// Errors surfaced by zerolayer operations.
///
/// External tool failures carry the tool's exit code and the tail of its
/// error stream. Nothing here is retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image builder exited unsuccessfully.
    #[error("Building image: {0}")]
    Build(CommandFailure),
    /// The local registry could not be inspected or started.
    #[error("Local registry unavailable: {0}")]
    RegistryUnavailable(CommandFailure),
    /// Pushing an image to the local registry failed.
    #[error("Pushing image: {0}")]
    Push(CommandFailure),
    /// The OS rebase tool failed.
    #[error("Rebasing: {0}")]
    Rebase(CommandFailure),
    /// An environment with this name already exists.
    #[error("Boot environment '{0}' already exists")]
    DuplicateName(String),
    /// No deployable environment with this name exists.
    #[error("Boot environment '{0}' not found")]
    NotFound(String),
    /// The environment is active and cannot be removed or overwritten.
    #[error("Boot environment '{0}' is active")]
    ActiveEnvironment(String),
    /// The name cannot be used as an environment name.
    #[error("Invalid boot environment name '{0}': use 1-64 characters of [A-Za-z0-9._-], not starting with '.' or '-'")]
    InvalidName(String),
    /// The source directory has no build recipe.
    #[error("No Containerfile or Dockerfile found in {0}")]
    MissingRecipe(Utf8PathBuf),
    /// The environment's built image is gone.
    #[error("Image for boot environment '{name}' is missing at {path}")]
    MissingArtifact {
        /// The environment name.
        name: String,
        /// Where the image was expected.
        path: Utf8PathBuf,
    },
    /// The operation was interrupted by a signal.
    #[error("Interrupted")]
    Interrupted,
    /// Any other failure, typically local I/O.
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error is caused by an invalid request rather than a
    /// failing tool or system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::DuplicateName(_)
                | Error::NotFound(_)
                | Error::ActiveEnvironment(_)
                | Error::InvalidName(_)
                | Error::MissingRecipe(_)
                | Error::MissingArtifact { .. }
        )
    }
}

impl ErrorExitCode for Error {
    fn exit_code(&self) -> i32 {
        if self.is_validation() {
            EXIT_VALIDATION
        } else {
            zerolayer_utils::EXIT_FAILURE
        }
    }
}

/// Result type alias for zerolayer operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let failure = CommandFailure::new("podman", Some(1), b"boom");
        assert_eq!(Error::Build(failure.clone()).exit_code(), 1);
        assert_eq!(Error::Rebase(failure).exit_code(), 1);
        assert_eq!(Error::Interrupted.exit_code(), 1);
        assert_eq!(Error::Other(anyhow::anyhow!("io")).exit_code(), 1);
        assert_eq!(Error::DuplicateName("base".into()).exit_code(), 2);
        assert_eq!(Error::NotFound("base".into()).exit_code(), 2);
        assert_eq!(Error::ActiveEnvironment("base".into()).exit_code(), 2);
    }

    #[test]
    fn test_display_includes_tool_output() {
        let e = Error::Build(CommandFailure::new(
            "podman",
            Some(125),
            b"STEP 1/3\nError: no such file\n",
        ));
        assert_eq!(
            e.to_string(),
            "Building image: podman exited with code 125: STEP 1/3\nError: no such file"
        );
        let e = Error::Other(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(e.to_string(), "outer: inner");
    }
}
