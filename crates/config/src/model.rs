use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use suprsync_checksum::Checksum;

/// Durations are configured as (possibly fractional) seconds.
fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| serde::de::Error::custom(format!("expected a non-negative number of seconds, got {secs}")))
}

fn optional_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "seconds")] Duration);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Archive this daemon instance owns.
    pub archive_name: String,
    /// Path of the SQLite store.
    pub db_path: PathBuf,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Bucket finalization; disabled when absent.
    #[serde(default)]
    pub finalize: Option<FinalizeConfig>,
}

/// How files are copied to the archive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    /// `rsync` when an SSH host is configured, native copy otherwise.
    #[default]
    Auto,
    Local,
    Rsync,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Base directory of the archive on the destination.
    pub basedir: PathBuf,
    /// `user@host`; files are copied over SSH when set.
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    /// Compress during transfer.
    #[serde(default)]
    pub compression: bool,
    /// Bandwidth limit in KiB/s.
    #[serde(default)]
    pub bwlimit: Option<u32>,
    #[serde(default)]
    pub mechanism: Mechanism,
    #[serde(default)]
    pub checksum: Checksum,
}

impl RemoteConfig {
    /// The mechanism to actually use, with `auto` resolved.
    #[must_use]
    pub fn resolved_mechanism(&self) -> Mechanism {
        match (self.mechanism, &self.ssh_host) {
            (Mechanism::Auto, Some(_)) => Mechanism::Rsync,
            (Mechanism::Auto, None) => Mechanism::Local,
            (mechanism, _) => mechanism,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopyConfig {
    /// Failed attempts after which a file is no longer retried.
    pub max_attempts: u32,
    /// Files per copy batch; unbounded when absent.
    pub files_per_batch: Option<usize>,
    /// Limit on one transfer invocation.
    #[serde(deserialize_with = "optional_seconds")]
    pub copy_timeout: Option<Duration>,
    /// Limit on one remote checksum invocation.
    #[serde(deserialize_with = "optional_seconds")]
    pub cmd_timeout: Option<Duration>,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self { max_attempts: 5, files_per_batch: None, copy_timeout: None, cmd_timeout: None }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Grace period after registration before a copied file is deleted
    /// locally. Files are never deleted when absent.
    #[serde(deserialize_with = "optional_seconds")]
    pub delete_local_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Pause between ticks.
    #[serde(deserialize_with = "seconds")]
    pub sleep_time: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { sleep_time: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalizeConfig {
    /// Local directory containing the archive's bucket directories.
    pub local_root: PathBuf,
    /// Identifies this daemon in completion markers.
    pub sync_id: String,
    /// Pause between finalization passes.
    #[serde(default = "FinalizeConfig::default_interval", deserialize_with = "seconds")]
    pub interval: Duration,
    /// Bucket width in seconds.
    #[serde(default = "FinalizeConfig::default_bucket_width")]
    pub bucket_width: u64,
    /// Exact digit count of bucket directory names; any when absent.
    #[serde(default = "FinalizeConfig::default_digits")]
    pub digits: Option<usize>,
    /// Extra buckets to wait before a bucket counts as closed.
    #[serde(default)]
    pub closure_lag: u64,
}

impl FinalizeConfig {
    fn default_interval() -> Duration {
        Duration::from_secs(3600)
    }

    fn default_bucket_width() -> u64 {
        100_000
    }

    fn default_digits() -> Option<usize> {
        Some(5)
    }
}
