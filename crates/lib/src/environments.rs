//! The Environment Registry: creating, looking up and deleting boot
//! environments.
//!
//! Every mutation goes through [`EnvironmentStore`], so the lock it holds
//! serializes concurrent invocations. Commands that only read open the
//! store with [`EnvironmentRegistry::open_readonly`].

use camino::Utf8Path;
use chrono::{DateTime, Utc};

use crate::build::{build_image, find_recipe, remove_artifacts, Builder};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::spec::{validate_name, BootEnvironment, BuildRequest, Status};
use crate::store::EnvironmentStore;

/// The durable table of boot environments plus the configuration needed to
/// build them.
#[derive(Debug)]
pub struct EnvironmentRegistry {
    store: EnvironmentStore,
    config: Config,
    progress: Progress,
}

impl EnvironmentRegistry {
    /// Open the store configured in `config`, waiting for any other
    /// invocation holding it.
    pub fn open(config: Config, progress: Progress) -> Result<Self> {
        let store = EnvironmentStore::open(&config.state_dir)?;
        Ok(Self {
            store,
            config,
            progress,
        })
    }

    /// Open the configured store without creating it or excluding other
    /// readers. Only dry runs and queries work on the result.
    pub fn open_readonly(config: Config, progress: Progress) -> Result<Self> {
        let store = EnvironmentStore::open_readonly(&config.state_dir)?;
        Ok(Self {
            store,
            config,
            progress,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The progress printer in use.
    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub(crate) fn store_mut(&mut self) -> &mut EnvironmentStore {
        &mut self.store
    }

    /// All environments, oldest first. Has no side effects.
    pub fn list(&self) -> Result<Vec<BootEnvironment>> {
        Ok(self.store.list()?)
    }

    /// Look up `name`.
    pub fn get(&self, name: &str) -> Result<BootEnvironment> {
        validate_name(name)?;
        self.store
            .get(name)?
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// The active environment, if any.
    pub fn active(&self) -> Result<Option<BootEnvironment>> {
        Ok(self.store.active()?)
    }

    /// Everything `create` checks before touching anything.
    fn prepare(
        &self,
        name: &str,
        source_dir: &Utf8Path,
        extra_args: &[String],
    ) -> Result<BuildRequest> {
        validate_name(name)?;
        if self.store.contains(name)? {
            return Err(Error::DuplicateName(name.to_owned()));
        }
        find_recipe(source_dir)?;
        let build_args = self
            .config
            .build_args
            .iter()
            .chain(extra_args)
            .cloned()
            .collect();
        Ok(BuildRequest {
            source_dir: source_dir.to_owned(),
            output: self.config.archive_path(name),
            build_args,
        })
    }

    /// Build `source_dir` into a new environment called `name`.
    ///
    /// A pending record exists only while the build runs: it becomes
    /// `Built` on success and is removed on failure. With `dry_run`
    /// nothing is written and the returned record is the one that would
    /// have been created.
    pub async fn create<B: Builder>(
        &mut self,
        builder: &B,
        name: &str,
        source_dir: &Utf8Path,
        extra_args: &[String],
        dry_run: bool,
    ) -> Result<BootEnvironment> {
        let req = self.prepare(name, source_dir, extra_args)?;
        let pending = BootEnvironment::new_pending(name, req.output.clone(), Utc::now());
        if dry_run {
            self.progress.planned(format_args!(
                "Would build {} into {}{}",
                req.source_dir,
                req.output,
                format_build_args(&req.build_args)
            ));
            return Ok(pending);
        }

        self.store.put(&pending)?;
        self.progress
            .step(format_args!("Building {name} from {}", req.source_dir));
        match self.finish_create(builder, &req, pending).await {
            Ok(env) => {
                self.progress
                    .step(format_args!("Built {name} at {}", req.output));
                Ok(env)
            }
            Err(e) => {
                if let Err(cleanup) = self.store.remove(name) {
                    tracing::warn!("Removing pending record for {name}: {cleanup:#}");
                }
                Err(e)
            }
        }
    }

    async fn finish_create<B: Builder>(
        &mut self,
        builder: &B,
        req: &BuildRequest,
        mut env: BootEnvironment,
    ) -> Result<BootEnvironment> {
        let built = build_image(builder, req).await?;
        env.image = built.image;
        env.digest = built.digest;
        env.status = Status::Built;
        if let Err(e) = self.store.put(&env) {
            if let Err(cleanup) = remove_artifacts(&req.output) {
                tracing::warn!("Cleanup after failed write: {cleanup:#}");
            }
            return Err(e.into());
        }
        Ok(env)
    }

    /// Remove `name` and its image. The active environment cannot be
    /// deleted; the table is left unchanged in that case.
    pub fn delete(&mut self, name: &str, dry_run: bool) -> Result<()> {
        let env = self.get(name)?;
        if env.status == Status::Active {
            return Err(Error::ActiveEnvironment(name.to_owned()));
        }
        self.remove(&env, dry_run)
    }

    /// The environments `delete_all` removes: everything but the active one.
    pub fn deletable(&self) -> Result<Vec<BootEnvironment>> {
        let mut envs = self.list()?;
        envs.retain(|e| e.status != Status::Active);
        Ok(envs)
    }

    /// Remove every environment except the active one, returning the
    /// names removed (or that would be, with `dry_run`).
    pub fn delete_all(&mut self, dry_run: bool) -> Result<Vec<String>> {
        let envs = self.deletable()?;
        if envs.is_empty() {
            self.progress.step(format_args!("Nothing to delete"));
            return Ok(Vec::new());
        }
        let names: Vec<String> = envs.iter().map(|e| e.name.clone()).collect();
        let affected = names.join(" ");
        if dry_run {
            self.progress
                .planned(format_args!("Affected environments: {affected}"));
        } else {
            self.progress
                .step(format_args!("Affected environments: {affected}"));
        }
        for env in &envs {
            self.remove(env, dry_run)?;
        }
        Ok(names)
    }

    fn remove(&mut self, env: &BootEnvironment, dry_run: bool) -> Result<()> {
        let name = env.name.as_str();
        let archive = env.image.archive_path();
        if dry_run {
            match archive {
                Some(p) => self
                    .progress
                    .planned(format_args!("Would remove {name} and {p}")),
                None => self.progress.planned(format_args!("Would remove {name}")),
            }
            return Ok(());
        }
        // The image goes first; a leftover record is visible in `list` and
        // can be deleted again, a leftover image would not be.
        if let Some(p) = archive {
            remove_artifacts(p)?;
        }
        self.store.remove(name)?;
        if let Some(pushed) = env.pushed.as_deref() {
            tracing::debug!("Leaving {pushed} in the local registry");
        }
        self.progress.step(format_args!("Deleted {name}"));
        Ok(())
    }
}

fn format_build_args(args: &[String]) -> String {
    args.iter().map(|a| format!(" --build-arg={a}")).collect()
}

/// The name `zerolayer all` gives the environment it creates at `now`.
pub fn auto_name(now: DateTime<Utc>) -> String {
    now.format("auto-%Y%m%d-%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use zerolayer_utils::ErrorExitCode;

    use super::*;
    use crate::config::RebaseTarget;
    use crate::testutils::{FakeBuilder, Fixture};
    use crate::EXIT_VALIDATION;

    fn open(fx: &Fixture) -> Result<EnvironmentRegistry> {
        EnvironmentRegistry::open(fx.config.clone(), Progress::new(true))
    }

    #[tokio::test]
    async fn test_create() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let builder = FakeBuilder::default();
        let recipe = fx.config.recipe_dir.clone();

        let env = envs.create(&builder, "base", &recipe, &[], false).await?;
        assert_eq!(env.status, Status::Built);
        assert_eq!(env.digest.as_deref(), Some("sha256:fake"));
        assert_eq!(
            env.image.archive_path(),
            Some(fx.root.join("images/base.oci.tar").as_path())
        );
        similar_asserts::assert_eq!(envs.get("base")?, env);

        let e = envs
            .create(&builder, "base", &recipe, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::DuplicateName(_)), "{e}");
        let all = envs.list()?;
        assert_eq!(all.iter().filter(|e| e.name == "base").count(), 1);
        assert_eq!(builder.calls.get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_build_args() -> anyhow::Result<()> {
        let mut fx = Fixture::new(RebaseTarget::Archive)?;
        fx.config.build_args = vec!["VARIANT=kinoite".into()];
        let mut envs = open(&fx)?;
        let builder = FakeBuilder::default();
        let recipe = fx.config.recipe_dir.clone();
        envs.create(&builder, "kde", &recipe, &["EXTRA=1".into()], false)
            .await?;
        assert_eq!(*builder.last_args.borrow(), ["VARIANT=kinoite", "EXTRA=1"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_record() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let builder = FakeBuilder::failing(1);
        let recipe = fx.config.recipe_dir.clone();

        let e = envs
            .create(&builder, "base", &recipe, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Build(_)), "{e}");
        assert!(envs.list()?.is_empty());
        assert!(matches!(envs.get("base"), Err(Error::NotFound(_))));
        assert_eq!(std::fs::read_dir(fx.root.join("images"))?.count(), 0);

        // A retry with a working builder is not blocked by the failure
        let env = envs
            .create(&FakeBuilder::default(), "base", &recipe, &[], false)
            .await?;
        assert_eq!(env.status, Status::Built);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_validation() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let builder = FakeBuilder::default();
        let recipe = fx.config.recipe_dir.clone();

        let e = envs
            .create(&builder, "../etc", &recipe, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::InvalidName(_)), "{e}");
        let e = envs
            .create(&builder, "base", &fx.root, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::MissingRecipe(_)), "{e}");
        assert_eq!(builder.calls.get(), 0);
        assert!(envs.list()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_dry_run() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let builder = FakeBuilder::default();
        let recipe = fx.config.recipe_dir.clone();

        let env = envs.create(&builder, "base", &recipe, &[], true).await?;
        assert_eq!(env.status, Status::Pending);
        assert_eq!(builder.calls.get(), 0);
        assert!(envs.list()?.is_empty());

        // Validation is the same as for a real run
        envs.create(&builder, "base", &recipe, &[], false).await?;
        let e = envs
            .create(&builder, "base", &recipe, &[], true)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::DuplicateName(_)), "{e}");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let recipe = fx.config.recipe_dir.clone();
        let env = envs
            .create(&FakeBuilder::default(), "base", &recipe, &[], false)
            .await?;
        let archive = env.image.archive_path().unwrap().to_owned();

        envs.delete("base", true)?;
        assert!(archive.exists());
        assert_eq!(envs.list()?.len(), 1);

        envs.delete("base", false)?;
        assert!(!archive.exists());
        assert!(envs.list()?.is_empty());
        assert!(matches!(envs.delete("base", false), Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_active() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let recipe = fx.config.recipe_dir.clone();
        let env = envs
            .create(&FakeBuilder::default(), "base", &recipe, &[], false)
            .await?;
        envs.store_mut().activate(&env)?;
        let before = envs.list()?;

        let e = envs.delete("base", false).unwrap_err();
        assert!(matches!(e, Error::ActiveEnvironment(_)), "{e}");
        let e = envs.delete("base", true).unwrap_err();
        assert!(matches!(e, Error::ActiveEnvironment(_)), "{e}");
        similar_asserts::assert_eq!(envs.list()?, before);
        assert!(env.image.archive_path().unwrap().exists());
        Ok(())
    }

    #[test]
    fn test_delete_pending() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        // As left behind by a killed process
        let pending =
            BootEnvironment::new_pending("base", fx.config.archive_path("base"), Utc::now());
        fx.store()?.put(&pending)?;
        let mut envs = open(&fx)?;
        envs.delete("base", false)?;
        assert!(envs.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_auto_name() {
        let t = Utc.with_ymd_and_hms(2026, 10, 17, 4, 5, 6).unwrap();
        assert_eq!(auto_name(t), "auto-20261017-040506");
        validate_name(&auto_name(t)).unwrap();
    }

    #[test]
    fn test_lookup_rejects_invalid_names() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        for name in ["../etc", "a/b", ""] {
            let e = envs.get(name).unwrap_err();
            assert!(matches!(e, Error::InvalidName(_)), "{name}: {e}");
            assert_eq!(e.exit_code(), EXIT_VALIDATION);
            let e = envs.delete(name, false).unwrap_err();
            assert!(matches!(e, Error::InvalidName(_)), "{name}: {e}");
            let e = envs.delete(name, true).unwrap_err();
            assert!(matches!(e, Error::InvalidName(_)), "{name}: {e}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_create_interrupted() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let recipe = fx.config.recipe_dir.clone();

        let e = envs
            .create(&FakeBuilder::interrupted(), "base", &recipe, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Interrupted), "{e}");
        // Neither the pending record nor any image survives
        assert!(envs.list()?.is_empty());
        assert!(fx.store()?.get("base")?.is_none());
        assert_eq!(std::fs::read_dir(fx.root.join("images"))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_all() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        let mut envs = open(&fx)?;
        let recipe = fx.config.recipe_dir.clone();
        let builder = FakeBuilder::default();
        let mut archives = Vec::new();
        for name in ["one", "two", "three"] {
            let env = envs.create(&builder, name, &recipe, &[], false).await?;
            archives.push(env.image.archive_path().unwrap().to_owned());
        }
        let active = envs.get("two")?;
        envs.store_mut().activate(&active)?;

        assert_eq!(envs.delete_all(true)?, ["one", "three"]);
        assert_eq!(envs.list()?.len(), 3);
        assert!(archives.iter().all(|p| p.exists()));

        assert_eq!(envs.delete_all(false)?, ["one", "three"]);
        let left = envs.list()?;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "two");
        assert_eq!(left[0].status, Status::Active);
        assert!(!archives[0].exists() && archives[1].exists() && !archives[2].exists());

        // Only the active environment is left; that is not an error
        assert!(envs.delete_all(false)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_readonly_dry_runs() -> anyhow::Result<()> {
        let fx = Fixture::new(RebaseTarget::Archive)?;
        assert!(!fx.config.state_dir.exists());
        let mut envs = EnvironmentRegistry::open_readonly(fx.config.clone(), Progress::new(true))?;
        let builder = FakeBuilder::default();
        let recipe = fx.config.recipe_dir.clone();

        assert!(envs.list()?.is_empty());
        envs.create(&builder, "base", &recipe, &[], true).await?;
        assert!(envs.delete_all(true)?.is_empty());
        assert!(matches!(envs.delete("base", true), Err(Error::NotFound(_))));
        assert!(!fx.config.state_dir.exists());

        // Real changes need a writable store
        assert!(envs.create(&builder, "base", &recipe, &[], false).await.is_err());
        assert!(!fx.config.state_dir.exists());
        Ok(())
    }
}
