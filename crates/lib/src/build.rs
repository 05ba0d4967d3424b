//! Building OCI images.
//!
//! The output archive location is empty before every build attempt and
//! after every attempt that does not succeed: stale artifacts are removed
//! up front, the builder writes to a `.partial` file, and only a successful
//! build is renamed into place.

use std::process::Stdio;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use zerolayer_utils::{AsyncCommandRunExt, CommandFailure};

use crate::error::{Error, Result};
use crate::spec::{BuildRequest, ImageReference};

/// File names accepted as a build recipe.
pub const RECIPE_FILES: &[&str] = &["Containerfile", "Dockerfile"];

/// An external OCI image builder.
#[allow(async_fn_in_trait)]
pub trait Builder {
    /// Build `req.source_dir` into an OCI archive at `output`, returning the
    /// image id if the builder reports one.
    async fn build(
        &self,
        req: &BuildRequest,
        output: &Utf8Path,
    ) -> Result<Option<String>, CommandFailure>;
}

/// A successfully built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// The complete archive.
    pub image: ImageReference,
    /// Image id, when known.
    pub digest: Option<String>,
}

/// Builds with `podman build`.
#[derive(Debug, Default)]
pub struct PodmanBuilder {
    quiet: bool,
}

impl PodmanBuilder {
    /// Create a builder; `quiet` discards the build log on stdout.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Builder for PodmanBuilder {
    async fn build(
        &self,
        req: &BuildRequest,
        output: &Utf8Path,
    ) -> Result<Option<String>, CommandFailure> {
        let tmp = tempfile::tempdir().map_err(|e| CommandFailure::spawn("podman", &e))?;
        let iidfile = tmp.path().join("iid");
        let mut cmd = tokio::process::Command::new("podman");
        cmd.arg("build").arg("--iidfile").arg(&iidfile);
        for arg in &req.build_args {
            cmd.arg(format!("--build-arg={arg}"));
        }
        cmd.arg("--tag")
            .arg(format!("oci-archive:{output}"))
            .arg(req.source_dir.as_str());
        if self.quiet {
            cmd.stdout(Stdio::null());
        }
        cmd.run_capture_tail().await?;
        // Not fatal; the image id is informational.
        let digest = match std::fs::read_to_string(&iidfile) {
            Ok(s) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
            Err(e) => {
                tracing::warn!("Reading image id: {e}");
                None
            }
        };
        Ok(digest)
    }
}

/// Where the builder writes before the result is moved to `output`.
pub fn partial_path(output: &Utf8Path) -> Utf8PathBuf {
    let mut p = output.as_str().to_owned();
    p.push_str(".partial");
    p.into()
}

/// Find the build recipe in `source_dir`.
pub fn find_recipe(source_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    RECIPE_FILES
        .iter()
        .map(|f| source_dir.join(f))
        .find(|p| p.is_file())
        .ok_or_else(|| Error::MissingRecipe(source_dir.to_owned()))
}

/// Remove the archive at `output` and any partial build; returns whether
/// anything was removed.
#[context("Removing {output}")]
pub fn remove_artifacts(output: &Utf8Path) -> anyhow::Result<bool> {
    let mut removed = false;
    for p in [output.to_owned(), partial_path(output)] {
        match std::fs::remove_file(&p) {
            Ok(()) => {
                tracing::debug!("Removed {p}");
                removed = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Removing {p}")),
        }
    }
    Ok(removed)
}

/// Build `req` with `builder`, guaranteeing that `req.output` holds either
/// nothing or one complete image afterwards.
///
/// SIGINT or SIGTERM kills the builder; cleanup still runs and
/// [`Error::Interrupted`] is returned.
pub async fn build_image<B: Builder>(builder: &B, req: &BuildRequest) -> Result<BuiltImage> {
    find_recipe(&req.source_dir)?;
    if let Some(parent) = req.output.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    if remove_artifacts(&req.output)? {
        tracing::info!("Removed stale artifact at {}", req.output);
    }

    let partial = partial_path(&req.output);
    let r = tokio::select! {
        r = builder.build(req, &partial) => r.map_err(Error::Build),
        _ = zerolayer_utils::wait_for_interrupt() => Err(Error::Interrupted),
    };
    let r = r.and_then(|digest| {
        std::fs::rename(&partial, &req.output)
            .with_context(|| format!("Renaming {partial} to {}", req.output))?;
        Ok(digest)
    });
    match r {
        Ok(digest) => Ok(BuiltImage {
            image: ImageReference::OciArchive {
                path: req.output.clone(),
            },
            digest,
        }),
        Err(e) => {
            if let Err(cleanup) = remove_artifacts(&req.output) {
                tracing::warn!("Cleanup after failed build: {cleanup:#}");
            }
            Err(e)
        }
    }
}
