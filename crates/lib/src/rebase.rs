//! The OS image rebase tool.

use std::process::Stdio;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use zerolayer_utils::{AsyncCommandRunExt, CommandFailure};

/// Container image references of the current deployments.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeploymentStatus {
    /// The image the system is booted into, if it is image based.
    pub booted: Option<String>,
    /// The image queued for the next boot.
    pub staged: Option<String>,
}

/// Repoints the system at another OS image.
#[allow(async_fn_in_trait)]
pub trait Rebaser {
    /// Rebase to `target`, an ostree container image reference such as
    /// `ostree-unverified-image:oci-archive:/path`.
    async fn rebase(&self, target: &str) -> Result<(), CommandFailure>;
    /// Query the booted and staged deployments.
    async fn status(&self) -> anyhow::Result<DeploymentStatus>;
}

/// Drives `rpm-ostree`.
#[derive(Debug, Default)]
pub struct RpmOstree {
    quiet: bool,
}

impl RpmOstree {
    /// Create a rebaser; `quiet` discards tool output on stdout.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

#[derive(Debug, Deserialize)]
struct RpmOstreeStatus {
    deployments: Vec<RpmOstreeDeployment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RpmOstreeDeployment {
    #[serde(default)]
    booted: bool,
    #[serde(default)]
    staged: bool,
    container_image_reference: Option<String>,
}

/// Parse the output of `rpm-ostree status --json`.
pub fn parse_status(buf: &[u8]) -> anyhow::Result<DeploymentStatus> {
    let status: RpmOstreeStatus =
        serde_json::from_slice(buf).context("Parsing rpm-ostree status")?;
    let mut r = DeploymentStatus::default();
    for d in status.deployments {
        if d.booted {
            r.booted = d.container_image_reference;
        } else if d.staged {
            r.staged = d.container_image_reference;
        }
    }
    Ok(r)
}

impl Rebaser for RpmOstree {
    async fn rebase(&self, target: &str) -> Result<(), CommandFailure> {
        let mut cmd = tokio::process::Command::new("rpm-ostree");
        cmd.args(["rebase", target]);
        if self.quiet {
            cmd.stdout(Stdio::null());
        }
        cmd.run_capture_tail().await?;
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<DeploymentStatus> {
        let o = tokio::process::Command::new("rpm-ostree")
            .args(["status", "--json"])
            .stdout(Stdio::piped())
            .run_capture_tail()
            .await?;
        parse_status(&o.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() -> anyhow::Result<()> {
        let buf = indoc::indoc! { r#"
            {
              "deployments": [
                {
                  "id": "fedora-a",
                  "staged": true,
                  "booted": false,
                  "container-image-reference": "ostree-unverified-image:oci-archive:/var/cache/zerolayer/next.oci.tar"
                },
                {
                  "id": "fedora-b",
                  "booted": true,
                  "container-image-reference": "ostree-unverified-registry:localhost:5000/zerolayer/base:latest"
                },
                {
                  "id": "fedora-c",
                  "booted": false,
                  "origin": "fedora:fedora/41/x86_64/silverblue"
                }
              ],
              "transaction": null
            }
        "# };
        let s = parse_status(buf.as_bytes())?;
        similar_asserts::assert_eq!(
            s,
            DeploymentStatus {
                booted: Some(
                    "ostree-unverified-registry:localhost:5000/zerolayer/base:latest".into()
                ),
                staged: Some(
                    "ostree-unverified-image:oci-archive:/var/cache/zerolayer/next.oci.tar".into()
                ),
            }
        );
        Ok(())
    }

    #[test]
    fn test_parse_status_package_based() -> anyhow::Result<()> {
        let s = parse_status(br#"{"deployments": [{"booted": true}]}"#)?;
        assert_eq!(s, DeploymentStatus::default());
        assert!(parse_status(b"not json").is_err());
        Ok(())
    }
}
