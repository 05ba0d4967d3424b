//! In-memory stand-ins for the external tools.

use std::cell::{Cell, RefCell};

use camino::{Utf8Path, Utf8PathBuf};

use crate::build::Builder;
use crate::config::{Config, RebaseTarget, RegistryConfig};
use crate::rebase::{DeploymentStatus, Rebaser};
use crate::registry::{RegistryRuntime, RegistryState};
use crate::spec::{BuildRequest, ImageReference};
use zerolayer_utils::CommandFailure;

/// Create `<td>/recipe` holding a Containerfile.
pub(crate) fn recipe_dir(td: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    let dir = td.join("recipe");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("Containerfile"), "FROM quay.io/fedora/fedora-bootc:41\n")?;
    Ok(dir)
}

/// A temporary state/image/recipe layout and a config pointing at it.
pub(crate) struct Fixture {
    _td: tempfile::TempDir,
    pub(crate) root: Utf8PathBuf,
    pub(crate) config: Config,
}

impl Fixture {
    pub(crate) fn new(target: RebaseTarget) -> anyhow::Result<Self> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_owned())?;
        let config = Config {
            state_dir: root.join("state"),
            image_dir: root.join("images"),
            recipe_dir: recipe_dir(&root)?,
            target,
            registry: RegistryConfig::default(),
            ..Default::default()
        };
        Ok(Self {
            _td: td,
            root,
            config,
        })
    }

    /// An opened store for this fixture's state directory.
    pub(crate) fn store(&self) -> anyhow::Result<crate::store::EnvironmentStore> {
        crate::store::EnvironmentStore::open(&self.config.state_dir)
    }
}

#[derive(Debug)]
pub(crate) struct FakeBuilder {
    fail: Option<i32>,
    interrupt: bool,
    pub(crate) calls: Cell<u32>,
    pub(crate) last_args: RefCell<Vec<String>>,
}

impl Default for FakeBuilder {
    fn default() -> Self {
        Self {
            fail: None,
            interrupt: false,
            calls: Cell::new(0),
            last_args: RefCell::new(Vec::new()),
        }
    }
}

impl FakeBuilder {
    /// A builder that writes partial output then exits with `code`.
    pub(crate) fn failing(code: i32) -> Self {
        Self {
            fail: Some(code),
            ..Default::default()
        }
    }

    /// A builder that writes partial output, then hangs until this process
    /// receives the SIGINT it sends itself.
    pub(crate) fn interrupted() -> Self {
        Self {
            interrupt: true,
            ..Default::default()
        }
    }
}

impl Builder for FakeBuilder {
    async fn build(
        &self,
        req: &BuildRequest,
        output: &Utf8Path,
    ) -> Result<Option<String>, CommandFailure> {
        self.calls.set(self.calls.get() + 1);
        *self.last_args.borrow_mut() = req.build_args.clone();
        if self.interrupt {
            std::fs::write(output, "half an image").map_err(|e| CommandFailure::spawn("fake", &e))?;
            // Runs once the caller yields, after its signal handlers are installed
            tokio::spawn(async {
                let pid = rustix::process::getpid();
                rustix::process::kill_process(pid, rustix::process::Signal::INT).unwrap();
            });
            return std::future::pending().await;
        }
        if let Some(code) = self.fail {
            std::fs::write(output, "half an image").map_err(|e| CommandFailure::spawn("fake", &e))?;
            return Err(CommandFailure::new(
                "podman",
                Some(code),
                b"Error: building at STEP \"RUN false\": exit status 1\n",
            ));
        }
        std::fs::write(output, "complete image").map_err(|e| CommandFailure::spawn("fake", &e))?;
        Ok(Some("sha256:fake".into()))
    }
}

#[derive(Debug)]
pub(crate) struct FakeRegistry {
    pub(crate) state: Cell<RegistryState>,
    pub(crate) inspects: Cell<u32>,
    pub(crate) starts: Cell<u32>,
    pub(crate) fail_inspect: Cell<bool>,
    pub(crate) fail_push: Cell<bool>,
    pub(crate) pushes: RefCell<Vec<(String, String)>>,
}

impl FakeRegistry {
    pub(crate) fn new(state: RegistryState) -> Self {
        Self {
            state: Cell::new(state),
            inspects: Cell::new(0),
            starts: Cell::new(0),
            fail_inspect: Cell::new(false),
            fail_push: Cell::new(false),
            pushes: RefCell::new(Vec::new()),
        }
    }
}

impl RegistryRuntime for FakeRegistry {
    async fn inspect(&self, _name: &str) -> Result<RegistryState, CommandFailure> {
        self.inspects.set(self.inspects.get() + 1);
        if self.fail_inspect.get() {
            return Err(CommandFailure::new(
                "podman",
                Some(125),
                b"Error: permission denied\n",
            ));
        }
        Ok(self.state.get())
    }

    async fn run(&self, _config: &RegistryConfig) -> Result<(), CommandFailure> {
        self.starts.set(self.starts.get() + 1);
        self.state.set(RegistryState::Running);
        Ok(())
    }

    async fn start(&self, _name: &str) -> Result<(), CommandFailure> {
        self.starts.set(self.starts.get() + 1);
        self.state.set(RegistryState::Running);
        Ok(())
    }

    async fn push(&self, source: &ImageReference, dest: &str) -> Result<(), CommandFailure> {
        if self.fail_push.get() {
            return Err(CommandFailure::new("skopeo", Some(1), b"connection refused\n"));
        }
        self.pushes
            .borrow_mut()
            .push((source.to_transport_string(), dest.to_owned()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeRebaser {
    pub(crate) fail: Cell<bool>,
    pub(crate) calls: RefCell<Vec<String>>,
    pub(crate) booted: RefCell<Option<String>>,
}

impl Rebaser for FakeRebaser {
    async fn rebase(&self, target: &str) -> Result<(), CommandFailure> {
        self.calls.borrow_mut().push(target.to_owned());
        if self.fail.get() {
            return Err(CommandFailure::new(
                "rpm-ostree",
                Some(1),
                b"error: Creating importer: failed to invoke method OpenImage\n",
            ));
        }
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<DeploymentStatus> {
        Ok(DeploymentStatus {
            booted: self.booted.borrow().clone(),
            staged: self.calls.borrow().last().cloned(),
        })
    }
}
