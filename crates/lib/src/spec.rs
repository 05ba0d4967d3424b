//! The definition of a boot environment and related values.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of an environment name.
pub const NAME_MAX: usize = 64;

/// Lifecycle state of a boot environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Recorded, build not yet complete.
    Pending,
    /// Image built and ready to deploy.
    Built,
    /// The environment the system was last rebased to.
    Active,
    /// Previously active; the image is still present.
    Stale,
}

impl Status {
    /// Whether an environment in this state can be rebased or switched to.
    pub fn is_deployable(self) -> bool {
        matches!(self, Status::Built | Status::Stale)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Built => "built",
            Status::Active => "active",
            Status::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Where a built OCI image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ImageReference {
    /// A local OCI archive file.
    OciArchive {
        /// Path to the archive.
        path: Utf8PathBuf,
    },
    /// An image in a container registry, as `host[:port]/repo:tag`.
    Registry {
        /// The registry reference.
        reference: String,
    },
}

impl ImageReference {
    /// The reference in containers-transports(5) syntax.
    pub fn to_transport_string(&self) -> String {
        match self {
            ImageReference::OciArchive { path } => format!("oci-archive:{path}"),
            ImageReference::Registry { reference } => format!("docker://{reference}"),
        }
    }

    /// The reference understood by `rpm-ostree rebase`.
    pub fn to_ostree_target(&self) -> String {
        match self {
            ImageReference::OciArchive { path } => {
                format!("ostree-unverified-image:oci-archive:{path}")
            }
            ImageReference::Registry { reference } => {
                format!("ostree-unverified-registry:{reference}")
            }
        }
    }

    /// The archive path, if this is a local archive.
    pub fn archive_path(&self) -> Option<&Utf8Path> {
        match self {
            ImageReference::OciArchive { path } => Some(path),
            ImageReference::Registry { .. } => None,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_transport_string())
    }
}

/// One buildable, bootable OS image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootEnvironment {
    /// Unique human identifier.
    pub name: String,
    /// The built image.
    pub image: ImageReference,
    /// Image id reported by the builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// When the environment was created.
    pub created_at: DateTime<Utc>,
    /// Lifecycle state.
    pub status: Status,
    /// Registry reference of the last successful push, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed: Option<String>,
    /// The rebase target used when this environment was last activated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_target: Option<String>,
}

impl BootEnvironment {
    /// A new pending environment whose image will be written to `archive`.
    pub fn new_pending(name: &str, archive: Utf8PathBuf, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_owned(),
            image: ImageReference::OciArchive { path: archive },
            digest: None,
            created_at,
            status: Status::Pending,
            pushed: None,
            deployed_target: None,
        }
    }
}

/// Input to the image builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Directory holding the Containerfile.
    pub source_dir: Utf8PathBuf,
    /// Where the finished OCI archive must end up.
    pub output: Utf8PathBuf,
    /// Extra `KEY=VALUE` build arguments.
    pub build_args: Vec<String>,
}

/// Check that `name` is usable as an environment name; it becomes a file
/// name and an image tag.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    let valid = !name.is_empty()
        && name.len() <= NAME_MAX
        && valid_chars
        && !name.starts_with(['.', '-']);
    if !valid {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}
