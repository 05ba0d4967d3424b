//! Fetching the build recipe used by `zerolayer all`.

use std::process::Stdio;

use anyhow::Context;
use camino::Utf8Path;
use zerolayer_utils::AsyncCommandRunExt;

use crate::error::Result;
use crate::progress::Progress;

/// Whether `dir` holds anything.
fn is_populated(dir: &Utf8Path) -> anyhow::Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut it) => Ok(it.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Reading {dir}")),
    }
}

/// Clone the recipe repository `url` into `dir`.
///
/// A populated `dir` is only replaced with `force`.
pub async fn init_recipe(
    url: &str,
    dir: &Utf8Path,
    force: bool,
    dry_run: bool,
    progress: &Progress,
) -> Result<()> {
    let populated = is_populated(dir)?;
    if populated && !force {
        return Err(anyhow::anyhow!("{dir} is not empty; use --force to replace it").into());
    }
    if dry_run {
        if populated {
            progress.planned(format_args!("Would remove {dir}"));
        }
        progress.planned(format_args!("Would run: git clone --depth=1 {url} {dir}"));
        return Ok(());
    }
    if populated {
        std::fs::remove_dir_all(dir).with_context(|| format!("Removing {dir}"))?;
    }
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    progress.step(format_args!("Cloning {url} into {dir}"));
    let mut cmd = tokio::process::Command::new("git");
    cmd.args(["clone", "--depth=1"]);
    if progress.is_quiet() {
        cmd.arg("--quiet").stdout(Stdio::null());
    }
    cmd.args([url, dir.as_str()]);
    cmd.run_capture_tail()
        .await
        .map_err(anyhow::Error::new)
        .context("Cloning recipe")?;
    Ok(())
}
