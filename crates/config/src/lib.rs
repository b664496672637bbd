//! Layered configuration for the sync daemon.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults (see the field docs on [`Config`]).
//! 2. A config file: TOML, YAML or JSON, chosen by extension. Without an
//!    explicit path the first `config.{toml,yaml,yml,json}` found in the
//!    platform config directory (e.g. `~/.config/suprsync/`) is used.
//! 3. `SUPRSYNC_*` environment variables, with `__` separating nested keys:
//!    `SUPRSYNC_REMOTE__SSH_HOST=data@archive` sets `remote.ssh_host`.
//!
//! Callers may merge further providers (command-line overrides) onto
//! [`figment()`] before calling [`Config::from_figment`].

pub mod error;
mod model;

pub use crate::model::{
    Config, CopyConfig, DaemonConfig, FinalizeConfig, Mechanism, RemoteConfig, RetentionConfig,
};
pub use figment::Figment;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "SUPRSYNC_";
const FILE_NAMES: [&str; 4] = ["config.toml", "config.yaml", "config.yml", "config.json"];

/// First config file present in the platform config directory.
#[must_use]
pub fn default_file() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "suprsync")?;
    FILE_NAMES.iter().map(|name| dirs.config_dir().join(name)).find(|path| path.is_file())
}

fn file_provider(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file_exact(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}

/// Assemble the file and environment layers.
///
/// An explicit `file` must exist; without one, the default location is used
/// if a file is present there.
pub fn figment(file: Option<&Path>) -> Result<Figment> {
    let file = match file {
        Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
        Some(path) => Some(path.to_path_buf()),
        None => default_file(),
    };
    let mut figment = Figment::new();
    if let Some(path) = &file {
        tracing::debug!(path = %path.display(), "Loading configuration file");
        figment = file_provider(figment, path)?;
    }
    Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

impl Config {
    /// Load from the default layers.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::from_figment(figment(file)?)
    }

    /// Extract and validate a configuration.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| exn::Exn::from(ErrorKind::Invalid(reason.to_string()));
        if self.archive_name.trim().is_empty() {
            return Err(invalid("archive_name must not be empty"));
        }
        if self.remote.basedir.as_os_str().is_empty() {
            return Err(invalid("remote.basedir must not be empty"));
        }
        if self.remote.resolved_mechanism() == Mechanism::Local && !self.remote.basedir.is_absolute() {
            return Err(invalid("remote.basedir must be absolute for local copies"));
        }
        if self.remote.mechanism == Mechanism::Local && self.remote.ssh_host.is_some() {
            return Err(invalid("remote.ssh_host cannot be used with the local mechanism"));
        }
        if self.copy.max_attempts == 0 {
            return Err(invalid("copy.max_attempts must be at least 1"));
        }
        if self.copy.files_per_batch == Some(0) {
            return Err(invalid("copy.files_per_batch must be at least 1"));
        }
        if let Some(finalize) = &self.finalize {
            if finalize.bucket_width == 0 {
                return Err(invalid("finalize.bucket_width must be at least 1"));
            }
            if finalize.digits == Some(0) {
                return Err(invalid("finalize.digits must be at least 1"));
            }
            if finalize.sync_id.trim().is_empty() || finalize.sync_id.contains('/') {
                return Err(invalid("finalize.sync_id must be a non-empty directory name"));
            }
        }
        Ok(())
    }
}
