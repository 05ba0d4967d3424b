//! Human and JSON renderings of the environment table and system status.

use std::io::Write;

use anyhow::Result;
use comfy_table::presets::NOTHING;
use comfy_table::Table;
use serde::Serialize;

use crate::environments::EnvironmentRegistry;
use crate::rebase::{DeploymentStatus, Rebaser};
use crate::spec::BootEnvironment;

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

/// Format a byte count with a binary unit, e.g. `1.5 GiB`.
pub fn human_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn archive_size(env: &BootEnvironment) -> String {
    env.image
        .archive_path()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| human_size(m.len()))
        .unwrap_or_else(|| "-".into())
}

/// Render `envs` as a table.
pub fn environments_table(envs: &[BootEnvironment]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_header(["NAME", "STATUS", "SIZE", "CREATED", "IMAGE"]);
    for env in envs {
        table.add_row([
            env.name.clone(),
            env.status.to_string(),
            archive_size(env),
            env.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            env.image.to_string(),
        ]);
    }
    table
}

/// Print the environment table, or the raw records with `json`.
pub fn print_environments(
    out: &mut impl Write,
    envs: &[BootEnvironment],
    json: bool,
) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, envs)?;
        writeln!(out)?;
    } else if envs.is_empty() {
        writeln!(out, "No boot environments")?;
    } else {
        writeln!(out, "{}", environments_table(envs))?;
    }
    Ok(())
}

/// The deployment state of the system as zerolayer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemStatus {
    /// Booted and staged images.
    #[serde(flatten)]
    pub deployments: DeploymentStatus,
    /// The environment recorded as active.
    pub active: Option<String>,
    /// Whether the active environment is the booted image.
    pub active_booted: bool,
}

impl SystemStatus {
    /// Combine the rebase tool's view with the recorded active environment.
    pub fn new(deployments: DeploymentStatus, active: Option<&BootEnvironment>) -> Self {
        let active_booted = match (active, deployments.booted.as_deref()) {
            (Some(env), Some(booted)) => env.deployed_target.as_deref() == Some(booted),
            _ => false,
        };
        Self {
            deployments,
            active: active.map(|e| e.name.clone()),
            active_booted,
        }
    }
}

/// Query `rebaser` and combine its answer with the active environment.
pub async fn system_status<O: Rebaser>(
    envs: &EnvironmentRegistry,
    rebaser: &O,
) -> crate::Result<SystemStatus> {
    let deployments = rebaser.status().await?;
    let active = envs.active()?;
    Ok(SystemStatus::new(deployments, active.as_ref()))
}

/// Keep at most `max` environments, the most recently created ones.
/// Returns how many were dropped.
pub fn limit_shown(envs: &mut Vec<BootEnvironment>, max: Option<usize>) -> usize {
    let Some(max) = max else {
        return 0;
    };
    let dropped = envs.len().saturating_sub(max);
    envs.drain(..dropped);
    dropped
}

/// Print `status` for humans, or as JSON.
pub fn print_status(out: &mut impl Write, status: &SystemStatus, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, status)?;
        writeln!(out)?;
        return Ok(());
    }
    let none = "<none>";
    let d = &status.deployments;
    writeln!(out, "Booted: {}", d.booted.as_deref().unwrap_or(none))?;
    if let Some(staged) = d.staged.as_deref() {
        writeln!(out, "Staged: {staged}")?;
    }
    match status.active.as_deref() {
        Some(name) if status.active_booted => writeln!(out, "Active: {name}")?,
        Some(name) => writeln!(out, "Active: {name} (not booted yet)")?,
        None => writeln!(out, "Active: {none}")?,
    }
    Ok(())
}
