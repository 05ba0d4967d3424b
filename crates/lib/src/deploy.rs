//! Rebasing the system onto a boot environment.
//!
//! A deployment walks `Built → Pushing → Rebasing → Active`; an external
//! tool failure moves it to `Failed` and aborts the remaining steps. The
//! environment's status is only written after the rebase tool succeeded,
//! so any failed or interrupted attempt can simply be retried.

use std::fmt;

use crate::build::Builder;
use crate::config::{Config, RebaseTarget};
use crate::environments::{auto_name, EnvironmentRegistry};
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::rebase::Rebaser;
use crate::registry::{ensure_running, probe, RegistryRuntime};
use crate::spec::{BootEnvironment, ImageReference, Status};

/// Which command requested the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Deploy with the configured target, pushing to the registry if needed.
    Rebase,
    /// Deploy an image that is already local or already pushed; never pushes.
    Switch,
}

/// Steps of a deployment, as logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Validated and ready.
    Built,
    /// Copying the image to the local registry.
    Pushing,
    /// Running the rebase tool.
    Rebasing,
    /// Committed.
    Active,
    /// An external tool failed; not retried.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Built => "built",
            Phase::Pushing => "pushing",
            Phase::Rebasing => "rebasing",
            Phase::Active => "active",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a deployment is going to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPlan {
    /// The environment being deployed.
    pub name: String,
    /// Whether the local registry must be running.
    pub needs_registry: bool,
    /// Image to copy and the registry reference to copy it to.
    pub push: Option<(ImageReference, String)>,
    /// Argument for the rebase tool.
    pub target: String,
}

impl DeployPlan {
    /// Plan deploying `env` without looking at the system.
    pub fn for_environment(config: &Config, env: &BootEnvironment, mode: Mode) -> Self {
        let name = env.name.clone();
        match (mode, env.pushed.as_deref(), config.target) {
            (Mode::Switch, Some(pushed), _) => Self {
                name,
                needs_registry: true,
                push: None,
                target: registry_target(pushed),
            },
            (Mode::Switch, None, _) | (Mode::Rebase, _, RebaseTarget::Archive) => Self {
                name,
                needs_registry: false,
                push: None,
                target: env.image.to_ostree_target(),
            },
            (Mode::Rebase, _, RebaseTarget::Registry) => {
                let reference = config.registry.reference_for(&env.name);
                Self {
                    name,
                    needs_registry: true,
                    target: registry_target(&reference),
                    push: Some((env.image.clone(), reference)),
                }
            }
        }
    }
}

fn registry_target(reference: &str) -> String {
    ImageReference::Registry {
        reference: reference.to_owned(),
    }
    .to_ostree_target()
}

/// Result of a deployment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The environment was already active; nothing was done.
    AlreadyActive(String),
    /// Dry run: validated, nothing mutated.
    Planned(DeployPlan),
    /// The rebase succeeded and the environment is now active.
    Activated(BootEnvironment),
}

/// Deploy `name`.
///
/// Only `Built` and `Stale` environments can be deployed; anything else
/// that is not already active is [`Error::NotFound`]. With `dry_run` the
/// same validation runs (including inspecting the registry) but nothing
/// is started, pushed, rebased or written.
pub async fn deploy<R: RegistryRuntime, O: Rebaser>(
    envs: &mut EnvironmentRegistry,
    runtime: &R,
    rebaser: &O,
    name: &str,
    mode: Mode,
    dry_run: bool,
) -> Result<Outcome> {
    let progress = envs.progress();
    let env = envs.get(name)?;
    if env.status == Status::Active {
        progress.step(format_args!("{name} is already active"));
        return Ok(Outcome::AlreadyActive(env.name));
    }
    if !env.status.is_deployable() {
        tracing::debug!("{name} is {}", env.status);
        return Err(Error::NotFound(name.to_owned()));
    }
    let plan = DeployPlan::for_environment(envs.config(), &env, mode);
    check_artifact(&env, &plan)?;
    execute(envs, runtime, rebaser, env, plan, dry_run).await
}

/// The local image must exist unless the plan only reads from the registry.
fn check_artifact(env: &BootEnvironment, plan: &DeployPlan) -> Result<()> {
    let reads_archive = plan.push.is_some() || !plan.needs_registry;
    match env.image.archive_path() {
        Some(path) if reads_archive && !path.exists() => Err(Error::MissingArtifact {
            name: env.name.clone(),
            path: path.to_owned(),
        }),
        _ => Ok(()),
    }
}

fn transition(name: &str, phase: Phase) {
    match phase {
        Phase::Failed => tracing::warn!("{name}: {phase}"),
        _ => tracing::info!("{name}: {phase}"),
    }
}

async fn execute<R: RegistryRuntime, O: Rebaser>(
    envs: &mut EnvironmentRegistry,
    runtime: &R,
    rebaser: &O,
    mut env: BootEnvironment,
    plan: DeployPlan,
    dry_run: bool,
) -> Result<Outcome> {
    let progress = envs.progress();
    let name = env.name.clone();
    transition(&name, Phase::Built);
    let r = if dry_run {
        plan_only(envs.config(), runtime, &progress, &plan)
            .await
            .map(|()| None)
    } else {
        run_steps(envs.config(), runtime, rebaser, &progress, &plan)
            .await
            .map(Some)
    };
    let pushed = match r {
        Ok(None) => return Ok(Outcome::Planned(plan)),
        Ok(Some(pushed)) => pushed,
        Err(e) => {
            transition(&name, Phase::Failed);
            return Err(e);
        }
    };

    if pushed.is_some() {
        env.pushed = pushed;
    }
    env.deployed_target = Some(plan.target.clone());
    let env = envs.store_mut().activate(&env)?;
    transition(&name, Phase::Active);
    progress.step(format_args!("{name} will be used on the next boot"));
    Ok(Outcome::Activated(env))
}

async fn plan_only<R: RegistryRuntime>(
    config: &Config,
    runtime: &R,
    progress: &Progress,
    plan: &DeployPlan,
) -> Result<()> {
    if plan.needs_registry {
        let handle = probe(runtime, &config.registry).await?;
        if !handle.running {
            progress.planned(format_args!(
                "Would start registry {} on port {}",
                handle.name, handle.port
            ));
        }
    }
    if let Some((source, dest)) = &plan.push {
        progress.planned(format_args!("Would push {source} to {dest}"));
    }
    progress.planned(format_args!("Would run: rpm-ostree rebase {}", plan.target));
    Ok(())
}

/// Run the mutating steps; returns the pushed reference, if any.
async fn run_steps<R: RegistryRuntime, O: Rebaser>(
    config: &Config,
    runtime: &R,
    rebaser: &O,
    progress: &Progress,
    plan: &DeployPlan,
) -> Result<Option<String>> {
    let name = plan.name.as_str();
    if plan.needs_registry {
        ensure_running(runtime, &config.registry, progress).await?;
    }
    let mut pushed = None;
    if let Some((source, dest)) = &plan.push {
        transition(name, Phase::Pushing);
        progress.step(format_args!("Pushing {name} to {dest}"));
        tokio::select! {
            r = runtime.push(source, dest) => r.map_err(Error::Push)?,
            _ = zerolayer_utils::wait_for_interrupt() => return Err(Error::Interrupted),
        }
        pushed = Some(dest.clone());
    }
    transition(name, Phase::Rebasing);
    progress.step(format_args!("Rebasing to {}", plan.target));
    tokio::select! {
        r = rebaser.rebase(&plan.target) => r.map_err(Error::Rebase)?,
        _ = zerolayer_utils::wait_for_interrupt() => return Err(Error::Interrupted),
    }
    Ok(pushed)
}

/// Create an environment from the configured recipe and rebase to it.
///
/// This is what the periodic timer runs. With `dry_run` the build and the
/// rebase are both planned against the record that would be created.
pub async fn create_and_rebase<B: Builder, R: RegistryRuntime, O: Rebaser>(
    envs: &mut EnvironmentRegistry,
    builder: &B,
    runtime: &R,
    rebaser: &O,
    dry_run: bool,
) -> Result<Outcome> {
    let name = auto_name(chrono::Utc::now());
    let recipe = envs.config().recipe_dir.clone();
    let env = envs.create(builder, &name, &recipe, &[], dry_run).await?;
    if dry_run {
        let plan = DeployPlan::for_environment(envs.config(), &env, Mode::Rebase);
        return execute(envs, runtime, rebaser, env, plan, true).await;
    }
    deploy(envs, runtime, rebaser, &name, Mode::Rebase, false).await
}
