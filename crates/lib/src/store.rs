//! The [`EnvironmentStore`] is the durable table of boot environments.
//!
//! Each record is a JSON file in `<state-dir>/environments`, replaced
//! atomically on every write. A writable store holds an exclusive `flock`
//! on `<state-dir>/lock` for its lifetime so that concurrent invocations
//! serialize instead of interleaving writes; a read-only store takes a
//! shared lock and never creates anything.

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, File};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::FlockOperation;

use crate::spec::{BootEnvironment, Status};

/// Directory holding one record per environment.
const ENVIRONMENTS: &str = "environments";
/// Lock file guarding the store.
const LOCK: &str = "lock";
const RECORD_SUFFIX: &str = ".json";

/// Handle to the persisted environment records.
#[derive(Debug)]
pub struct EnvironmentStore {
    // None if a read-only store found no state directory yet
    records: Option<Dir>,
    writable: bool,
    // Holds the flock until dropped
    _lock: Option<File>,
}

fn record_name(name: &str) -> String {
    format!("{name}{RECORD_SUFFIX}")
}

/// Take `op` on `lock`, logging and blocking if another process holds it.
fn acquire(lock: &File, op: FlockOperation) -> Result<()> {
    let nonblocking = match op {
        FlockOperation::LockShared => FlockOperation::NonBlockingLockShared,
        _ => FlockOperation::NonBlockingLockExclusive,
    };
    match rustix::fs::flock(lock, nonblocking) {
        Ok(()) => Ok(()),
        Err(e) if e == rustix::io::Errno::WOULDBLOCK => {
            tracing::warn!("Another zerolayer process holds the lock; waiting");
            rustix::fs::flock(lock, op).context("flock")
        }
        Err(e) => Err(e).context("flock"),
    }
}

impl EnvironmentStore {
    /// Open (creating if needed) the store rooted at `state_dir`.
    #[context("Opening environment store at {state_dir}")]
    pub fn open(state_dir: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir).with_context(|| format!("Creating {state_dir}"))?;
        let root = Dir::open_ambient_dir(state_dir, cap_std::ambient_authority())?;
        Self::open_at(&root)
    }

    /// Open the store inside an already opened state directory.
    pub fn open_at(root: &Dir) -> Result<Self> {
        let lock = root.create(LOCK).context("Creating lock file")?;
        acquire(&lock, FlockOperation::LockExclusive)?;
        root.create_dir_all(ENVIRONMENTS)
            .with_context(|| format!("Creating {ENVIRONMENTS}"))?;
        let records = root.open_dir(ENVIRONMENTS)?;
        Ok(Self {
            records: Some(records),
            writable: true,
            _lock: Some(lock),
        })
    }

    /// Open the store at `state_dir` for reading only. A missing state
    /// directory is an empty store.
    #[context("Opening environment store at {state_dir} read-only")]
    pub fn open_readonly(state_dir: &Utf8Path) -> Result<Self> {
        match Dir::open_ambient_dir(state_dir, cap_std::ambient_authority()) {
            Ok(root) => Self::open_readonly_at(&root),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                records: None,
                writable: false,
                _lock: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Open the store inside `root` for reading only.
    pub fn open_readonly_at(root: &Dir) -> Result<Self> {
        let lock = root.open_optional(LOCK).context("Opening lock file")?;
        if let Some(lock) = lock.as_ref() {
            acquire(lock, FlockOperation::LockShared)?;
        }
        let records = root.open_dir_optional(ENVIRONMENTS)?;
        Ok(Self {
            records,
            writable: false,
            _lock: lock,
        })
    }

    fn writable_records(&self) -> Result<&Dir> {
        match self.records.as_ref() {
            Some(d) if self.writable => Ok(d),
            _ => anyhow::bail!("Environment store is open read-only"),
        }
    }

    /// All records, ordered by creation time (then name).
    #[context("Listing environments")]
    pub fn list(&self) -> Result<Vec<BootEnvironment>> {
        let mut r = Vec::new();
        let Some(records) = self.records.as_ref() else {
            return Ok(r);
        };
        for entry in records.entries_utf8()? {
            let entry = entry?;
            let file_name = entry.file_name()?;
            let Some(name) = file_name.strip_suffix(RECORD_SUFFIX) else {
                // Includes temporary files of an in-progress atomic write
                tracing::trace!("Ignoring {file_name}");
                continue;
            };
            if let Some(env) = self.get(name)? {
                r.push(env);
            }
        }
        r.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(r)
    }

    /// Look up a single record.
    pub fn get(&self, name: &str) -> Result<Option<BootEnvironment>> {
        let path = record_name(name);
        let Some(records) = self.records.as_ref() else {
            return Ok(None);
        };
        let Some(f) = records.open_optional(&path)? else {
            return Ok(None);
        };
        let env: BootEnvironment = serde_json::from_reader(std::io::BufReader::new(f))
            .with_context(|| format!("Parsing {path}"))?;
        anyhow::ensure!(env.name == name, "Record {path} is for '{}'", env.name);
        Ok(Some(env))
    }

    /// Whether a record exists for `name`.
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self
            .records
            .as_ref()
            .is_some_and(|d| d.exists(record_name(name))))
    }

    /// Write a record, replacing any previous version.
    #[context("Writing environment {}", env.name)]
    pub fn put(&mut self, env: &BootEnvironment) -> Result<()> {
        let buf = serde_json::to_vec_pretty(env)?;
        self.writable_records()?
            .atomic_write(record_name(&env.name), buf)?;
        Ok(())
    }

    /// Remove a record; returns whether it existed.
    #[context("Removing environment {name}")]
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        Ok(self
            .writable_records()?
            .remove_file_optional(record_name(name))?)
    }

    /// The active environment, if any.
    pub fn active(&self) -> Result<Option<BootEnvironment>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|e| e.status == Status::Active))
    }

    /// Make `env` the single active environment.
    ///
    /// Every other active record is marked stale before `env` is written,
    /// so a crash in between leaves no active environment rather than two.
    #[context("Activating {}", env.name)]
    pub fn activate(&mut self, env: &BootEnvironment) -> Result<BootEnvironment> {
        for mut other in self.list()? {
            if other.status == Status::Active && other.name != env.name {
                tracing::debug!("Marking {} stale", other.name);
                other.status = Status::Stale;
                self.put(&other)?;
            }
        }
        let mut env = env.clone();
        env.status = Status::Active;
        self.put(&env)?;
        Ok(env)
    }
}
