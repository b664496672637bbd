use super::{from_secs, to_secs};
use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use std::path::PathBuf;
use std::time::Duration;
use time::UtcDateTime;

/// When the local copy of a file went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The file was already missing when the retention pass tried to delete
    /// it (removed out-of-band). Persisted as `0`.
    AlreadyGone,
    /// Deleted by the retention pass at this instant.
    At(UtcDateTime),
}

impl Removal {
    pub(crate) fn to_secs(self) -> f64 {
        match self {
            Removal::AlreadyGone => 0.0,
            Removal::At(at) => to_secs(at),
        }
    }

    fn from_secs(secs: f64) -> Result<Self, Error> {
        if secs == 0.0 { Ok(Removal::AlreadyGone) } else { Ok(Removal::At(from_secs(secs)?)) }
    }
}

/// One file that must end up, byte-identical, in the remote archive.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    /// Absolute path on the local filesystem.
    pub local_path: PathBuf,
    pub local_checksum: String,
    pub archive_name: String,
    /// Relative to the archive's remote base directory.
    pub remote_path: String,
    /// Time bucket the file belongs to, if the archive is bucketed.
    pub timecode: Option<i64>,
    pub size: u64,
    /// Checksum computed on the remote side after a copy; `None` until then.
    pub remote_checksum: Option<String>,
    pub created_at: UtcDateTime,
    pub copied_at: Option<UtcDateTime>,
    pub removed_at: Option<Removal>,
    pub failed_attempts: u32,
    /// Whether the local file may be removed once it is copy-complete.
    pub deletable: bool,
}

impl FileRecord {
    /// The remote copy has been verified against the local checksum.
    #[must_use]
    pub fn is_copied(&self) -> bool {
        self.remote_checksum.as_deref() == Some(self.local_checksum.as_str())
    }

    /// Whether the retention pass may delete the local file at `now`.
    #[must_use]
    pub fn is_deletable_at(&self, now: UtcDateTime, grace: Duration) -> bool {
        self.is_copied() && self.deletable && self.removed_at.is_none() && now - self.created_at >= grace
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    id: i64,
    local_path: String,
    local_checksum: String,
    archive_name: String,
    remote_path: String,
    timecode: Option<i64>,
    size: i64,
    remote_checksum: Option<String>,
    created_at: f64,
    copied_at: Option<f64>,
    removed_at: Option<f64>,
    failed_attempts: i64,
    deletable: bool,
}
impl TryFrom<FileRow> for FileRecord {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            local_path: PathBuf::from(row.local_path),
            local_checksum: row.local_checksum,
            archive_name: row.archive_name,
            remote_path: row.remote_path,
            timecode: row.timecode,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            remote_checksum: row.remote_checksum,
            created_at: from_secs(row.created_at)?,
            copied_at: row.copied_at.map(from_secs).transpose()?,
            removed_at: row.removed_at.map(Removal::from_secs).transpose()?,
            failed_attempts: u32::try_from(row.failed_attempts)
                .or_raise(|| ErrorKind::InvalidData("failed attempts"))?,
            deletable: row.deletable,
        })
    }
}

/// A file to be registered with the store.
///
/// ```
/// use suprsync_store::models::NewFile;
///
/// let file = NewFile::new("/data/17145/obs.g3", "17145/obs.g3", "timestreams").keep();
/// assert!(!file.deletable);
/// ```
#[derive(Debug, Clone)]
pub struct NewFile {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub archive_name: String,
    /// Precomputed local checksum. The file is hashed on registration when absent.
    pub checksum: Option<String>,
    pub deletable: bool,
    /// Registration time; defaults to now.
    pub timestamp: Option<UtcDateTime>,
}

impl NewFile {
    pub fn new(local_path: impl Into<PathBuf>, remote_path: impl Into<String>, archive_name: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            archive_name: archive_name.into(),
            checksum: None,
            deletable: true,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Never delete the local file, even once it has been copied.
    #[must_use]
    pub fn keep(mut self) -> Self {
        self.deletable = false;
        self
    }

    #[must_use]
    pub fn deletable(mut self, deletable: bool) -> Self {
        self.deletable = deletable;
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: UtcDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Result of one copy attempt for one record, as committed by the copy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The remote checksum matches the local one.
    Verified { id: i64, remote_checksum: String },
    /// The remote checksum was determined and differs. Stored (together with
    /// `copied_at`) and counted as a failed attempt.
    Mismatch { id: i64, remote_checksum: String },
    /// The attempt failed before anything could be verified, e.g. the local
    /// file vanished. Counted as a failed attempt.
    Failed { id: i64 },
}

impl CopyOutcome {
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            CopyOutcome::Verified { id, .. } | CopyOutcome::Mismatch { id, .. } | CopyOutcome::Failed { id } => *id,
        }
    }

    /// `(remote_checksum, copied_at, failed_attempts increment)` to bind.
    pub(crate) fn bindings(&self, now: UtcDateTime) -> (Option<&str>, Option<f64>, i64) {
        match self {
            CopyOutcome::Verified { remote_checksum, .. } => (Some(remote_checksum), Some(to_secs(now)), 0),
            CopyOutcome::Mismatch { remote_checksum, .. } => (Some(remote_checksum), Some(to_secs(now)), 1),
            CopyOutcome::Failed { .. } => (None, None, 1),
        }
    }
}
