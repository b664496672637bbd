//! Finalization Engine: advance the per-archive "safe to read up to here"
//! watermark one time bucket at a time.
//!
//! A bucket moves through three states, each only ever set once:
//! 1. **completed**: it is older than the current bucket (minus the closure
//!    lag), so no producer writes into it any more.
//! 2. **synced**: every record the store knows in it is copy-complete.
//! 3. **finalized**: a completion marker describing the bucket has been
//!    registered, copied and verified like any other file.
//!
//! Marker files live in the *current* bucket, so they are themselves picked
//! up by a later bucket's sync check.

use crate::copy::{CopyEngine, CopyReport};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::Serialize;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use suprsync_store::Repository;
use suprsync_store::error::ErrorKind as StoreErrorKind;
use suprsync_store::models::{NewFile, TimecodeDir, TimecodeFlags};
use time::UtcDateTime;
use tracing::{debug, info, instrument, warn};

/// Directory under the current bucket that holds markers on the remote side.
const REMOTE_MARKER_DIR: &str = "suprsync";

/// Where this instance finds its buckets and how it labels its markers.
#[derive(Debug, Clone)]
pub struct FinalizeSettings {
    /// Local directory containing the archive's bucket directories.
    pub local_root: PathBuf,
    /// Identifies this daemon in marker paths and contents.
    pub sync_id: String,
    /// Extra buckets to wait before a bucket counts as closed.
    pub closure_lag: u64,
}

/// Contents of a bucket's completion marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub timecode: i64,
    pub num_files: usize,
    /// Subdirectories of the local bucket directory.
    pub subdirs: Vec<String>,
    /// Unix seconds.
    pub finalized_at: f64,
    /// Watermark at the start of the pass that wrote this marker.
    pub finalized_until: Option<i64>,
    pub archive_name: String,
    pub instance_id: String,
}

/// What one finalization pass did.
#[derive(Debug, Default, Clone)]
pub struct FinalizeReport {
    /// Buckets newly marked completed.
    pub completed: Vec<i64>,
    /// Buckets newly marked synced.
    pub synced: Vec<i64>,
    /// Buckets whose marker was registered during this pass.
    pub markers: Vec<i64>,
    /// Buckets newly marked finalized.
    pub finalized: Vec<i64>,
    /// Buckets whose marker could not be written or registered.
    pub marker_errors: Vec<i64>,
    /// Result of pushing pending markers through the copy engine.
    pub copy: Option<CopyReport>,
    /// Why pushing pending markers failed, if it did. Retried next pass.
    pub copy_error: Option<ErrorKind>,
    /// Watermark after the pass.
    pub finalized_until: Option<i64>,
}

#[derive(Clone)]
pub struct Finalizer {
    repo: Repository,
    copy: CopyEngine,
    archive: String,
    settings: FinalizeSettings,
}

impl Finalizer {
    pub fn new(repo: Repository, copy: CopyEngine, archive: impl Into<String>, settings: FinalizeSettings) -> Self {
        Self { repo, copy, archive: archive.into(), settings }
    }

    pub fn archive(&self) -> &str {
        &self.archive
    }

    /// Run one finalization pass against the wall clock.
    pub async fn update_timecode_dirs(&self) -> Result<FinalizeReport> {
        self.update_timecode_dirs_at(UtcDateTime::now()).await
    }

    /// Run one finalization pass as if it were `now`.
    ///
    /// Only [`StoreUnavailable`](ErrorKind::StoreUnavailable) is returned;
    /// problems with individual markers and with the marker copy are logged
    /// and reported, and retried on the next pass.
    #[instrument(skip(self), fields(archive = %self.archive))]
    pub async fn update_timecode_dirs_at(&self, now: UtcDateTime) -> Result<FinalizeReport> {
        let scheme = *self.repo.timecodes();
        let current = scheme.bucket_of(now);
        let lag = i64::try_from(self.settings.closure_lag).unwrap_or(i64::MAX);
        let closed_below = current.saturating_sub(lag);
        let watermark = self.repo.finalized_until(&self.archive).await.map_err(ErrorKind::store)?;
        let mut report = FinalizeReport::default();

        self.scan_local_root().await?;

        for mut dir in self.repo.timecode_dirs(&self.archive).await.map_err(ErrorKind::store)? {
            if !dir.completed && dir.timecode < closed_below {
                dir = self.raise(&dir, TimecodeFlags::COMPLETED).await?;
                report.completed.push(dir.timecode);
            }
            if dir.completed && !dir.synced && self.uncopied(dir.timecode).await? == 0 {
                dir = self.raise(&dir, TimecodeFlags::SYNCED).await?;
                report.synced.push(dir.timecode);
            }
            if dir.synced && !dir.finalized && dir.finalize_file_id.is_none() {
                match self.write_marker(&dir, current, watermark, now).await {
                    Ok(true) => report.markers.push(dir.timecode),
                    Ok(false) => {},
                    Err(err) if *err == ErrorKind::StoreUnavailable => return Err(err),
                    Err(err) => {
                        warn!(timecode = dir.timecode, error = ?err, "Could not finalize bucket");
                        report.marker_errors.push(dir.timecode);
                    },
                }
            }
        }

        match self.flush_markers().await {
            Ok(copy) => report.copy = copy,
            Err(err) if *err == ErrorKind::StoreUnavailable => return Err(err),
            Err(err) => {
                warn!(error = ?err, "Could not copy completion markers; retrying next pass");
                report.copy_error = Some(*err);
            },
        }

        for dir in self.repo.timecode_dirs(&self.archive).await.map_err(ErrorKind::store)? {
            let Some(marker_id) = dir.finalize_file_id.filter(|_| !dir.finalized) else {
                continue;
            };
            let marker = self.repo.get(marker_id).await.map_err(ErrorKind::store)?;
            if marker.is_some_and(|m| m.is_copied()) {
                self.raise(&dir, TimecodeFlags::FINALIZED).await?;
                report.finalized.push(dir.timecode);
            }
        }

        report.finalized_until = self.repo.finalized_until(&self.archive).await.map_err(ErrorKind::store)?;
        if report.finalized_until < watermark {
            // The store refuses to index buckets below the watermark, so this
            // would mean a bucket was un-finalized behind our back.
            warn!(before = ?watermark, after = ?report.finalized_until, "Finalized watermark moved backwards");
        }
        info!(
            current,
            completed = report.completed.len(),
            synced = report.synced.len(),
            markers = report.markers.len(),
            finalized = report.finalized.len(),
            finalized_until = ?report.finalized_until,
            "Finalization pass finished"
        );
        Ok(report)
    }

    /// Index every bucket directory under the local root.
    async fn scan_local_root(&self) -> Result<()> {
        let root = &self.settings.local_root;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                warn!(root = %root.display(), "Local root does not exist; only known buckets are checked");
                return Ok(());
            },
            Err(err) => {
                warn!(root = %root.display(), error = %err, "Could not list local root");
                return Ok(());
            },
        };
        let scheme = *self.repo.timecodes();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "Error while listing local root");
                    break;
                },
            };
            let path = entry.path();
            let Some(timecode) = scheme.from_dir(&path) else {
                continue;
            };
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            if self.repo.upsert_timecode_dir(&self.archive, timecode).await.map_err(ErrorKind::store)?.is_none() {
                warn!(timecode, path = %path.display(), "Bucket directory below the finalized watermark was never indexed");
            }
        }
        Ok(())
    }

    async fn uncopied(&self, timecode: i64) -> Result<u64> {
        self.repo.bucket_uncopied(&self.archive, timecode).await.map_err(ErrorKind::store)
    }

    async fn raise(&self, dir: &TimecodeDir, flags: TimecodeFlags) -> Result<TimecodeDir> {
        let updated = self.repo.update_timecode_dir(dir.id, flags).await.map_err(ErrorKind::store)?;
        debug!(timecode = dir.timecode, ?flags, "Bucket state raised");
        Ok(updated)
    }

    /// Write a bucket's marker locally and register it. Returns `false` when
    /// the bucket turned out not to need one.
    async fn write_marker(
        &self,
        dir: &TimecodeDir,
        current: i64,
        watermark: Option<i64>,
        now: UtcDateTime,
    ) -> Result<bool> {
        // Files may have been registered since the bucket was marked synced.
        if self.uncopied(dir.timecode).await? > 0 {
            debug!(timecode = dir.timecode, "Bucket gained uncopied files; not finalizing yet");
            return Ok(false);
        }
        let scheme = self.repo.timecodes();
        let num_files = self.repo.bucket_files(&self.archive, dir.timecode).await.map_err(ErrorKind::store)?.len();
        let marker = Marker {
            timecode: dir.timecode,
            num_files,
            subdirs: subdirectories(&self.settings.local_root.join(scheme.dir_name(dir.timecode))).await,
            finalized_at: now.unix_timestamp() as f64 + f64::from(now.nanosecond()) / 1e9,
            finalized_until: watermark,
            archive_name: self.archive.clone(),
            instance_id: self.settings.sync_id.clone(),
        };
        let file_name = format!("{}_{}_{}_finalized.yaml", now.unix_timestamp(), self.archive, dir.timecode);
        let current_dir = scheme.dir_name(current);
        let local_dir = self.settings.local_root.join(&current_dir).join(&self.settings.sync_id);
        let local_path = local_dir.join(&file_name);
        let remote_path = format!("{current_dir}/{REMOTE_MARKER_DIR}/{}/{file_name}", self.settings.sync_id);

        let contents = serde_yaml::to_string(&marker).or_raise(|| ErrorKind::Marker)?;
        tokio::fs::create_dir_all(&local_dir).await.or_raise(|| ErrorKind::Marker)?;
        tokio::fs::write(&local_path, contents).await.or_raise(|| ErrorKind::Marker)?;

        let registered = self
            .repo
            .attach_finalize_marker(dir, NewFile::new(&local_path, remote_path, &self.archive))
            .await
            .map_err(|err| {
                if matches!(&*err, StoreErrorKind::Unreadable(_)) {
                    err.raise(ErrorKind::Marker)
                } else {
                    ErrorKind::store(err)
                }
            })?;
        match registered {
            Some(record) => {
                info!(timecode = dir.timecode, id = record.id, path = %local_path.display(), "Registered completion marker");
                Ok(true)
            },
            None => {
                debug!(timecode = dir.timecode, "Bucket already has a marker; discarding ours");
                remove_quietly(&local_path).await;
                Ok(false)
            },
        }
    }

    /// Copy every registered but not yet verified marker.
    async fn flush_markers(&self) -> Result<Option<CopyReport>> {
        let max_attempts = self.copy.settings().max_attempts;
        let mut pending = Vec::new();
        for dir in self.repo.timecode_dirs(&self.archive).await.map_err(ErrorKind::store)? {
            let Some(marker_id) = dir.finalize_file_id.filter(|_| !dir.finalized) else {
                continue;
            };
            let Some(record) = self.repo.get(marker_id).await.map_err(ErrorKind::store)? else {
                continue;
            };
            let exhausted = max_attempts.is_some_and(|max| record.failed_attempts >= max);
            if !record.is_copied() && record.removed_at.is_none() && !exhausted {
                pending.push(record);
            }
        }
        if pending.is_empty() {
            return Ok(None);
        }
        self.copy.copy_records(pending).await.map(Some)
    }
}

async fn subdirectories(dir: &Path) -> Vec<String> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|t| t.is_dir())
            && let Some(name) = entry.file_name().to_str()
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    names
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %err, "Could not remove discarded marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::CopySettings;
    use std::sync::Arc;
    use suprsync_store::{Database, TimecodeScheme};
    use suprsync_transfer::MockCopier;
    use tempfile::TempDir;

    const ARCHIVE: &str = "test";
    const WIDTH: u64 = 100;

    struct Fixture {
        db: Database,
        repo: Repository,
        copier: Arc<MockCopier>,
        finalizer: Finalizer,
        root: TempDir,
    }

    async fn fixture(closure_lag: u64) -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db).with_timecodes(TimecodeScheme::new(WIDTH, Some(3)).unwrap());
        let copier = Arc::new(MockCopier::default());
        let copy = CopyEngine::new(repo.clone(), copier.clone(), CopySettings::default());
        let root = tempfile::tempdir().unwrap();
        let settings = FinalizeSettings { local_root: root.path().to_path_buf(), sync_id: "node1".to_string(), closure_lag };
        let finalizer = Finalizer::new(repo.clone(), copy, ARCHIVE, settings);
        Fixture { db, repo, copier, finalizer, root }
    }

    impl Fixture {
        async fn register(&self, timecode: i64, name: &str) {
            let dir = self.root.path().join(format!("{timecode:03}"));
            tokio::fs::create_dir_all(&dir).await.unwrap();
            let path = dir.join(name);
            tokio::fs::write(&path, name).await.unwrap();
            self.repo.register(NewFile::new(path, format!("{timecode:03}/{name}"), ARCHIVE)).await.unwrap();
        }
    }

    fn at(secs: i64) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[tokio::test]
    async fn test_two_phase_finalization() {
        let f = fixture(0).await;
        f.register(100, "a.g3").await;
        f.register(101, "b.g3").await;
        tokio::fs::create_dir_all(f.root.path().join("100/sat1")).await.unwrap();

        // Bucket 101 is current at t=10150.
        let now = at(10_150);
        let report = f.finalizer.update_timecode_dirs_at(now).await.unwrap();
        assert_eq!(report.completed, vec![100]);
        assert!(report.synced.is_empty() && report.markers.is_empty());
        assert_eq!(report.finalized_until, None);

        f.finalizer.copy.copy_batch(ARCHIVE).await.unwrap();
        let report = f.finalizer.update_timecode_dirs_at(now).await.unwrap();
        assert_eq!(report.synced, vec![100]);
        assert_eq!(report.markers, vec![100]);
        assert_eq!(report.finalized, vec![100]);
        assert_eq!(report.finalized_until, Some(100));

        let dir = f.repo.get_timecode_dir(ARCHIVE, 100).await.unwrap().unwrap();
        assert!(dir.completed && dir.synced && dir.finalized);
        let marker = f.repo.get(dir.finalize_file_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(marker.remote_path, "101/suprsync/node1/10150_test_100_finalized.yaml");
        assert_eq!(marker.timecode, Some(101));
        assert!(marker.is_copied());
        let yaml = String::from_utf8(f.copier.get(&marker.remote_path).await.unwrap()).unwrap();
        assert!(yaml.contains("timecode: 100"));
        assert!(yaml.contains("num_files: 1"));
        assert!(yaml.contains("- sat1"));
        assert!(yaml.contains("instance_id: node1"));

        // The current bucket never completes.
        let current = f.repo.get_timecode_dir(ARCHIVE, 101).await.unwrap().unwrap();
        assert!(!current.completed);
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_closure_lag_delays_completion() {
        let f = fixture(1).await;
        f.register(100, "a.g3").await;
        let report = f.finalizer.update_timecode_dirs_at(at(10_150)).await.unwrap();
        assert!(report.completed.is_empty());
        let report = f.finalizer.update_timecode_dirs_at(at(10_250)).await.unwrap();
        assert_eq!(report.completed, vec![100]);
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_marker_copy_failure_is_retried() {
        let f = fixture(0).await;
        f.register(100, "a.g3").await;
        f.finalizer.copy.copy_batch(ARCHIVE).await.unwrap();
        f.copier.fail_next(suprsync_transfer::Failure::NonZero(12)).await;

        let now = at(10_150);
        let report = f.finalizer.update_timecode_dirs_at(now).await.unwrap();
        assert_eq!(report.markers, vec![100]);
        assert_eq!(report.copy_error, Some(ErrorKind::TransferFailed));
        assert!(report.finalized.is_empty());
        assert_eq!(report.finalized_until, None);

        // No second marker is written; the existing one is copied.
        let report = f.finalizer.update_timecode_dirs_at(at(10_160)).await.unwrap();
        assert!(report.markers.is_empty());
        assert_eq!(report.finalized, vec![100]);
        let mut markers = tokio::fs::read_dir(f.root.path().join("101/node1")).await.unwrap();
        let mut count = 0;
        while markers.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_gap_blocks_watermark() {
        let f = fixture(0).await;
        f.register(100, "a.g3").await;
        f.register(101, "b.g3").await;
        f.register(102, "c.g3").await;
        f.copier.hide("101/b.g3").await;
        f.finalizer.copy.copy_batch(ARCHIVE).await.unwrap();

        let report = f.finalizer.update_timecode_dirs_at(at(10_350)).await.unwrap();
        assert_eq!(report.finalized, vec![100, 102]);
        assert_eq!(report.finalized_until, Some(100));
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_missing_local_root_uses_known_buckets() {
        let f = fixture(0).await;
        f.register(100, "a.g3").await;
        f.finalizer.copy.copy_batch(ARCHIVE).await.unwrap();
        let settings = FinalizeSettings { local_root: f.root.path().join("missing"), ..f.finalizer.settings.clone() };
        let finalizer = Finalizer::new(f.repo.clone(), f.finalizer.copy.clone(), ARCHIVE, settings);
        let report = finalizer.update_timecode_dirs_at(at(10_150)).await.unwrap();
        assert_eq!(report.completed, vec![100]);
        assert_eq!(report.finalized, vec![100]);
        f.db.close().await;
    }
}
