//! # Configuration
//!
//! zerolayer reads an optional TOML file, by default
//! `/etc/zerolayer/config.toml`:
//!
//! ```toml
//! image-dir = "/var/cache/zerolayer"
//! target = "registry"
//!
//! [registry]
//! port = 5001
//! ```
//!
//! A few environment variables override the file after it is loaded.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Default path of the configuration file.
pub const CONFIG_PATH: &str = "/etc/zerolayer/config.toml";
/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "ZEROLAYER_CONFIG";

/// Overrides `state-dir`.
pub const STATE_DIR_ENV: &str = "ZEROLAYER_STATE_DIR";
/// Overrides `image-dir`.
pub const IMAGE_DIR_ENV: &str = "ZEROLAYER_IMAGE_DIR";
/// Overrides `recipe-dir`.
pub const RECIPE_DIR_ENV: &str = "ZEROLAYER_RECIPE_DIR";
/// Older spelling of [`RECIPE_DIR_ENV`].
pub const LEGACY_RECIPE_DIR_ENV: &str = "ZEROLAYER_CONTAINERFILE_DIR";

/// How `rebase` hands an image to the OS rebase tool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebaseTarget {
    /// Point rpm-ostree directly at the OCI archive.
    #[default]
    Archive,
    /// Push to the local registry and rebase from there.
    Registry,
}

/// Settings for the local container registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Container name of the registry.
    pub name: String,
    /// Host port the registry is published on.
    pub port: u16,
    /// Named volume backing the registry storage.
    pub volume: String,
    /// The registry container image.
    pub image: String,
    /// Repository prefix images are pushed under.
    pub repository: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "zerolayer-registry".into(),
            port: 5000,
            volume: "zerolayer-registry".into(),
            image: "docker.io/library/registry:2".into(),
            repository: "zerolayer".into(),
        }
    }
}

impl RegistryConfig {
    /// The registry reference for environment `name`.
    pub fn reference_for(&self, name: &str) -> String {
        format!("localhost:{}/{}/{name}:latest", self.port, self.repository)
    }
}

/// Top level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct Config {
    /// Where environment records are kept.
    pub state_dir: Utf8PathBuf,
    /// Where built OCI archives are written.
    pub image_dir: Utf8PathBuf,
    /// The recipe used by `zerolayer all`.
    pub recipe_dir: Utf8PathBuf,
    /// Git repository cloned by `zerolayer init`.
    pub recipe_url: String,
    /// `KEY=VALUE` arguments passed to every build.
    pub build_args: Vec<String>,
    /// How rebases reach the image.
    pub target: RebaseTarget,
    /// Local registry settings.
    pub registry: RegistryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: "/var/lib/zerolayer".into(),
            image_dir: "/var/cache/zerolayer".into(),
            recipe_dir: "/etc/zerolayer/recipe".into(),
            recipe_url: "https://github.com/ublue-os/startingpoint".into(),
            build_args: Vec::new(),
            target: RebaseTarget::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl Config {
    /// Load the configuration.
    ///
    /// An explicitly requested file (argument or `ZEROLAYER_CONFIG`) must
    /// exist; the default path is optional.
    #[context("Loading configuration")]
    pub fn load(explicit: Option<&Utf8Path>) -> anyhow::Result<Self> {
        let from_env = std::env::var(CONFIG_ENV).ok().map(Utf8PathBuf::from);
        let (path, required) = match explicit.map(ToOwned::to_owned).or(from_env) {
            Some(p) => (p, true),
            None => (Utf8PathBuf::from(CONFIG_PATH), false),
        };
        let mut config = match std::fs::read_to_string(&path) {
            Ok(s) => Self::parse(&s).with_context(|| format!("Parsing {path}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!("No configuration at {path}, using defaults");
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        config.apply_env(|k| std::env::var(k).ok());
        Ok(config)
    }

    /// Parse configuration from TOML.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Apply the environment overrides, using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(STATE_DIR_ENV) {
            self.state_dir = v.into();
        }
        if let Some(v) = lookup(IMAGE_DIR_ENV) {
            self.image_dir = v.into();
        }
        if let Some(v) = lookup(RECIPE_DIR_ENV).or_else(|| lookup(LEGACY_RECIPE_DIR_ENV)) {
            self.recipe_dir = v.into();
        }
    }

    /// The OCI archive path for environment `name`.
    pub fn archive_path(&self, name: &str) -> Utf8PathBuf {
        self.image_dir.join(format!("{name}.oci.tar"))
    }
}
