//! The local container registry used as a rebase source.
//!
//! The registry is started lazily, right before something needs to be
//! pushed to or pulled from it, and is never torn down here.

use std::process::Stdio;

use zerolayer_utils::{AsyncCommandRunExt, CommandFailure};

use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::spec::ImageReference;

/// Port the registry listens on inside its container.
const REGISTRY_CONTAINER_PORT: u16 = 5000;

/// Observed state of the registry container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// No container with the configured name exists.
    Absent,
    /// The container exists but is not running.
    Stopped,
    /// The container is running.
    Running,
}

/// A container runtime able to host a registry and push to it.
#[allow(async_fn_in_trait)]
pub trait RegistryRuntime {
    /// Inspect the state of the container called `name`.
    async fn inspect(&self, name: &str) -> Result<RegistryState, CommandFailure>;
    /// Create and start a new registry container.
    async fn run(&self, config: &RegistryConfig) -> Result<(), CommandFailure>;
    /// Start an existing, stopped container.
    async fn start(&self, name: &str) -> Result<(), CommandFailure>;
    /// Copy `source` to the registry reference `dest`.
    async fn push(&self, source: &ImageReference, dest: &str) -> Result<(), CommandFailure>;
}

/// Runtime state of the registry; recomputed on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryHandle {
    /// Container name.
    pub name: String,
    /// Bound host port.
    pub port: u16,
    /// Storage volume.
    pub volume: String,
    /// Whether the registry is running (after [`ensure_running`], always).
    pub running: bool,
    /// Whether this invocation started it.
    pub started: bool,
}

impl RegistryHandle {
    fn new(config: &RegistryConfig, running: bool, started: bool) -> Self {
        Self {
            name: config.name.clone(),
            port: config.port,
            volume: config.volume.clone(),
            running,
            started,
        }
    }
}

/// Make sure the registry is running, starting it if needed.
///
/// If inspection fails no start is attempted. The window between inspecting
/// and starting is not guarded; a concurrent start surfaces as a
/// name-collision failure from the runtime.
pub async fn ensure_running<R: RegistryRuntime>(
    runtime: &R,
    config: &RegistryConfig,
    progress: &Progress,
) -> Result<RegistryHandle> {
    let state = runtime
        .inspect(&config.name)
        .await
        .map_err(Error::RegistryUnavailable)?;
    tracing::debug!("Registry {} is {state:?}", config.name);
    let r = match state {
        RegistryState::Running => return Ok(RegistryHandle::new(config, true, false)),
        RegistryState::Stopped => {
            progress.step(format_args!("Starting registry {}", config.name));
            runtime.start(&config.name).await
        }
        RegistryState::Absent => {
            progress.step(format_args!(
                "Creating registry {} on port {}",
                config.name, config.port
            ));
            runtime.run(config).await
        }
    };
    r.map_err(Error::RegistryUnavailable)?;
    Ok(RegistryHandle::new(config, true, true))
}

/// Inspect the registry without changing anything.
pub async fn probe<R: RegistryRuntime>(
    runtime: &R,
    config: &RegistryConfig,
) -> Result<RegistryHandle> {
    let state = runtime
        .inspect(&config.name)
        .await
        .map_err(Error::RegistryUnavailable)?;
    Ok(RegistryHandle::new(
        config,
        state == RegistryState::Running,
        false,
    ))
}

/// The podman implementation of [`RegistryRuntime`]; pushes use skopeo.
#[derive(Debug, Default)]
pub struct PodmanRegistry {
    quiet: bool,
}

impl PodmanRegistry {
    /// Create a runtime; `quiet` discards tool output on stdout.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl RegistryRuntime for PodmanRegistry {
    async fn inspect(&self, name: &str) -> Result<RegistryState, CommandFailure> {
        // `container exists` exits 1 for a missing container, and anything
        // else for real failures.
        let r = tokio::process::Command::new("podman")
            .args(["container", "exists", name])
            .run_capture_tail()
            .await;
        match r {
            Ok(_) => {}
            Err(e) if e.exit_code == Some(1) => return Ok(RegistryState::Absent),
            Err(e) => return Err(e),
        }
        let o = tokio::process::Command::new("podman")
            .args(["container", "inspect", "--format", "{{.State.Running}}", name])
            .stdout(Stdio::piped())
            .run_capture_tail()
            .await?;
        let running = String::from_utf8_lossy(&o.stdout).trim() == "true";
        Ok(if running {
            RegistryState::Running
        } else {
            RegistryState::Stopped
        })
    }

    async fn run(&self, config: &RegistryConfig) -> Result<(), CommandFailure> {
        tokio::process::Command::new("podman")
            .args(["run", "--detach", "--restart=always", "--name"])
            .arg(&config.name)
            .arg("--publish")
            .arg(format!("{}:{REGISTRY_CONTAINER_PORT}", config.port))
            .arg("--volume")
            .arg(format!("{}:/var/lib/registry", config.volume))
            .arg(&config.image)
            .stdout(Stdio::null())
            .run_capture_tail()
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), CommandFailure> {
        tokio::process::Command::new("podman")
            .args(["start", name])
            .stdout(Stdio::null())
            .run_capture_tail()
            .await?;
        Ok(())
    }

    async fn push(&self, source: &ImageReference, dest: &str) -> Result<(), CommandFailure> {
        let mut cmd = tokio::process::Command::new("skopeo");
        cmd.args(["copy", "--dest-tls-verify=false"])
            .arg(source.to_transport_string())
            .arg(format!("docker://{dest}"));
        if self.quiet {
            cmd.stdout(Stdio::null());
        }
        cmd.run_capture_tail().await?;
        Ok(())
    }
}
