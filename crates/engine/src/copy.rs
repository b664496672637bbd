//! Copy Engine: move a bounded batch of pending files and verify them.

use crate::error::{ErrorKind, Result};
use std::time::{Duration, Instant};
use suprsync_store::Repository;
use suprsync_store::models::{CopyOutcome, FileRecord};
use suprsync_transfer::error::ErrorKind as TransferErrorKind;
use suprsync_transfer::{CopierHandle, Manifest};
use time::UtcDateTime;
use tracing::{debug, info, instrument, warn};

/// Limits applied to every batch.
#[derive(Debug, Clone, Default)]
pub struct CopySettings {
    /// Records with this many failed attempts are no longer picked up.
    pub max_attempts: Option<u32>,
    /// Maximum number of records per batch.
    pub files_per_batch: Option<usize>,
    /// Limit on the transfer invocation.
    pub copy_timeout: Option<Duration>,
    /// Limit on the remote checksum invocation.
    pub cmd_timeout: Option<Duration>,
}

/// A per-file problem that was counted against the record rather than
/// aborting the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub id: i64,
    pub kind: ErrorKind,
}

/// What one batch did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyReport {
    /// Records handed to the copier.
    pub transferred: usize,
    /// Records whose remote checksum now matches.
    pub verified: Vec<i64>,
    /// Records whose remote checksum could not be determined after the
    /// transfer succeeded. Nothing is recorded about the remote copy, but the
    /// attempt counts so the record cannot hold the head of the queue forever.
    pub undetermined: Vec<i64>,
    /// Records that had an attempt counted against them.
    pub failures: Vec<FileFailure>,
}

impl CopyReport {
    pub fn mismatched(&self) -> usize {
        self.failures.iter().filter(|f| f.kind == ErrorKind::VerificationMismatch).count()
    }

    pub fn is_empty(&self) -> bool {
        self.transferred == 0 && self.failures.is_empty()
    }
}

/// Copies pending records with a [`Copier`](suprsync_transfer::Copier) and
/// records verified results.
///
/// A record is only ever marked copied on the strength of an independently
/// computed remote checksum, never because the transfer said so.
#[derive(Clone)]
pub struct CopyEngine {
    repo: Repository,
    copier: CopierHandle,
    settings: CopySettings,
}

impl CopyEngine {
    pub fn new(repo: Repository, copier: CopierHandle, settings: CopySettings) -> Self {
        Self { repo, copier, settings }
    }

    pub fn settings(&self) -> &CopySettings {
        &self.settings
    }

    /// Copy and verify the next batch of copyable records of an archive.
    ///
    /// Nothing to do is the common case and returns an empty report.
    ///
    /// # Errors
    /// - [`TransferTimeout`](ErrorKind::TransferTimeout) /
    ///   [`TransferFailed`](ErrorKind::TransferFailed): the batch was aborted
    ///   and nothing was written to the store; it is retried next tick.
    /// - [`StoreUnavailable`](ErrorKind::StoreUnavailable).
    #[instrument(skip(self), fields(copier = self.copier.name()))]
    pub async fn copy_batch(&self, archive: &str) -> Result<CopyReport> {
        let records = self
            .repo
            .copyable(archive, self.settings.max_attempts, self.settings.files_per_batch)
            .await
            .map_err(ErrorKind::store)?;
        self.copy_records(records).await
    }

    /// Copy and verify specific records, committing all outcomes in one
    /// transaction.
    pub async fn copy_records(&self, records: Vec<FileRecord>) -> Result<CopyReport> {
        let mut report = CopyReport::default();
        if records.is_empty() {
            return Ok(report);
        }
        let mut outcomes = Vec::with_capacity(records.len());
        let mut manifest = Manifest::new();
        // (record, normalized remote path), in manifest order.
        let mut sent = Vec::with_capacity(records.len());
        for record in records {
            let present = tokio::fs::metadata(&record.local_path).await.is_ok_and(|m| m.is_file());
            if !present {
                warn!(id = record.id, path = %record.local_path.display(), "Local file missing; counting failed attempt");
                outcomes.push(CopyOutcome::Failed { id: record.id });
                report.failures.push(FileFailure { id: record.id, kind: ErrorKind::Io });
                continue;
            }
            match manifest.push(&record.local_path, &record.remote_path) {
                Ok(remote) => sent.push((record, remote)),
                Err(err) => {
                    let reason = match &*err {
                        TransferErrorKind::DuplicateRemote(_) => "duplicate remote path in batch",
                        _ => "invalid remote path",
                    };
                    warn!(id = record.id, remote = %record.remote_path, reason, "Not sending file; counting failed attempt");
                    outcomes.push(CopyOutcome::Failed { id: record.id });
                    report.failures.push(FileFailure { id: record.id, kind: ErrorKind::TransferFailed });
                },
            }
        }

        if !manifest.is_empty() {
            let started = Instant::now();
            self.copier.transfer(&manifest, self.settings.copy_timeout).await.map_err(ErrorKind::transfer)?;
            debug!(files = manifest.len(), elapsed = ?started.elapsed(), "Transfer finished; verifying");
            let checksums = self
                .copier
                .checksum(&manifest.remote_paths(), self.settings.cmd_timeout)
                .await
                .map_err(ErrorKind::transfer)?;
            report.transferred = manifest.len();
            for (record, remote) in sent {
                match checksums.get(&remote) {
                    None => {
                        warn!(
                            id = record.id,
                            remote = %remote.display(),
                            attempts = record.failed_attempts + 1,
                            "Remote checksum undeterminable; counting failed attempt"
                        );
                        report.undetermined.push(record.id);
                        outcomes.push(CopyOutcome::Failed { id: record.id });
                    },
                    Some(remote_checksum) if *remote_checksum == record.local_checksum => {
                        report.verified.push(record.id);
                        outcomes.push(CopyOutcome::Verified { id: record.id, remote_checksum: remote_checksum.clone() });
                    },
                    Some(remote_checksum) => {
                        warn!(
                            id = record.id,
                            remote = %remote.display(),
                            local = %record.local_checksum,
                            remote_checksum = %remote_checksum,
                            attempts = record.failed_attempts + 1,
                            "Remote checksum mismatch"
                        );
                        report.failures.push(FileFailure { id: record.id, kind: ErrorKind::VerificationMismatch });
                        outcomes.push(CopyOutcome::Mismatch { id: record.id, remote_checksum: remote_checksum.clone() });
                    },
                }
            }
        }

        self.repo.record_copy_outcomes(&outcomes, UtcDateTime::now()).await.map_err(ErrorKind::store)?;
        info!(
            transferred = report.transferred,
            verified = report.verified.len(),
            undetermined = report.undetermined.len(),
            failed = report.failures.len(),
            destination = %self.copier.destination(),
            "Copy batch committed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use suprsync_store::Database;
    use suprsync_store::models::NewFile;
    use rstest::rstest;
    use suprsync_transfer::{Failure, MockCopier};
    use tempfile::TempDir;

    const ARCHIVE: &str = "test";

    struct Fixture {
        db: Database,
        repo: Repository,
        copier: Arc<MockCopier>,
        engine: CopyEngine,
        dir: TempDir,
    }

    async fn fixture(settings: CopySettings) -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let copier = Arc::new(MockCopier::default());
        let engine = CopyEngine::new(repo.clone(), copier.clone(), settings);
        Fixture { db, repo, copier, engine, dir: tempfile::tempdir().unwrap() }
    }

    impl Fixture {
        async fn register(&self, name: &str, remote: &str) -> FileRecord {
            let path: PathBuf = self.dir.path().join(name);
            tokio::fs::write(&path, name.as_bytes()).await.unwrap();
            self.repo.register(NewFile::new(path, remote, ARCHIVE)).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let f = fixture(CopySettings::default()).await;
        let report = f.engine.copy_batch(ARCHIVE).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(f.copier.transfers().await, 0);
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_batch_respects_limit() {
        let f = fixture(CopySettings { files_per_batch: Some(2), ..Default::default() }).await;
        for i in 0..3 {
            f.register(&format!("{i}.g3"), &format!("{i}.g3")).await;
        }
        assert_eq!(f.engine.copy_batch(ARCHIVE).await.unwrap().verified.len(), 2);
        assert_eq!(f.engine.copy_batch(ARCHIVE).await.unwrap().verified.len(), 1);
        assert!(f.engine.copy_batch(ARCHIVE).await.unwrap().is_empty());
        assert_eq!(f.copier.files_sent().await, 3);
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_mismatch_and_undetermined() {
        let f = fixture(CopySettings::default()).await;
        let good = f.register("good.g3", "good.g3").await;
        let bad = f.register("bad.g3", "bad.g3").await;
        let hidden = f.register("hidden.g3", "hidden.g3").await;
        f.copier.corrupt("bad.g3").await;
        f.copier.hide("hidden.g3").await;

        let report = f.engine.copy_batch(ARCHIVE).await.unwrap();
        assert_eq!(report.verified, vec![good.id]);
        assert_eq!(report.undetermined, vec![hidden.id]);
        assert_eq!(report.failures, vec![FileFailure { id: bad.id, kind: ErrorKind::VerificationMismatch }]);
        assert_eq!(report.mismatched(), 1);

        let bad = f.repo.get(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.failed_attempts, 1);
        assert!(bad.remote_checksum.is_some() && bad.copied_at.is_some() && !bad.is_copied());
        // Nothing is known about the remote copy, but the attempt counts.
        let hidden = f.repo.get(hidden.id).await.unwrap().unwrap();
        assert_eq!((hidden.failed_attempts, hidden.remote_checksum, hidden.copied_at), (1, None, None));
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_undeterminable_file_does_not_block_queue() {
        let f = fixture(CopySettings { max_attempts: Some(3), files_per_batch: Some(1), ..Default::default() }).await;
        let stuck = f.register("stuck.g3", "stuck.g3").await;
        let next = f.register("next.g3", "next.g3").await;
        f.copier.hide("stuck.g3").await;

        for _ in 0..3 {
            assert_eq!(f.engine.copy_batch(ARCHIVE).await.unwrap().undetermined, vec![stuck.id]);
        }
        assert_eq!(f.engine.copy_batch(ARCHIVE).await.unwrap().verified, vec![next.id]);
        assert!(f.engine.copy_batch(ARCHIVE).await.unwrap().is_empty());

        let stuck = f.repo.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.failed_attempts, 3);
        assert!(!stuck.is_copied());
        assert!(f.repo.get(next.id).await.unwrap().unwrap().is_copied());
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_uppercase_supplied_checksum_becomes_copied() {
        let f = fixture(CopySettings::default()).await;
        let path = f.dir.path().join("a.g3");
        tokio::fs::write(&path, b"test").await.unwrap();
        let record = f
            .repo
            .register(NewFile::new(path, "a.g3", ARCHIVE).with_checksum("098F6BCD4621D373CADE4E832627B4F6"))
            .await
            .unwrap();

        assert_eq!(f.engine.copy_batch(ARCHIVE).await.unwrap().verified, vec![record.id]);
        assert!(f.repo.get(record.id).await.unwrap().unwrap().is_copied());
        assert!(f.engine.copy_batch(ARCHIVE).await.unwrap().is_empty());
        assert_eq!(f.copier.files_sent().await, 1);
        f.db.close().await;
    }

    #[rstest]
    #[case(Failure::Timeout, ErrorKind::TransferTimeout)]
    #[case(Failure::NonZero(12), ErrorKind::TransferFailed)]
    // The file arrived, but a failed transfer is not trusted.
    #[case(Failure::NonZeroAfterCopy(23), ErrorKind::TransferFailed)]
    #[tokio::test]
    async fn test_transfer_failure_leaves_store_untouched(#[case] failure: Failure, #[case] expected: ErrorKind) {
        let f = fixture(CopySettings { copy_timeout: Some(Duration::from_secs(5)), ..Default::default() }).await;
        let record = f.register("a.g3", "a.g3").await;
        f.copier.fail_next(failure).await;

        assert_eq!(*f.engine.copy_batch(ARCHIVE).await.unwrap_err(), expected);
        let untouched = f.repo.get(record.id).await.unwrap().unwrap();
        assert_eq!((untouched.failed_attempts, untouched.remote_checksum, untouched.copied_at), (0, None, None));

        let report = f.engine.copy_batch(ARCHIVE).await.unwrap();
        assert_eq!(report.verified, vec![record.id]);
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_missing_local_file_and_duplicate_remote() {
        let f = fixture(CopySettings::default()).await;
        let gone = f.register("gone.g3", "gone.g3").await;
        tokio::fs::remove_file(&gone.local_path).await.unwrap();
        let first = f.register("first.g3", "17145/same.g3").await;
        let second = f.register("second.g3", "17145//same.g3").await;

        let report = f.engine.copy_batch(ARCHIVE).await.unwrap();
        assert_eq!(report.transferred, 1);
        assert_eq!(report.verified, vec![first.id]);
        assert_eq!(
            report.failures,
            vec![
                FileFailure { id: gone.id, kind: ErrorKind::Io },
                FileFailure { id: second.id, kind: ErrorKind::TransferFailed },
            ]
        );
        assert_eq!(f.repo.get(gone.id).await.unwrap().unwrap().failed_attempts, 1);
        assert_eq!(f.repo.get(second.id).await.unwrap().unwrap().failed_attempts, 1);
        f.db.close().await;
    }

    #[tokio::test]
    async fn test_bounded_retry() {
        let f = fixture(CopySettings { max_attempts: Some(3), ..Default::default() }).await;
        let record = f.register("a.g3", "a.g3").await;
        f.copier.corrupt_all(true).await;
        for _ in 0..3 {
            assert_eq!(f.engine.copy_batch(ARCHIVE).await.unwrap().mismatched(), 1);
        }
        assert!(f.engine.copy_batch(ARCHIVE).await.unwrap().is_empty());
        assert_eq!(f.copier.files_sent().await, 3);
        let exhausted = f.repo.exhausted_files(ARCHIVE, 3).await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].id, record.id);
        f.db.close().await;
    }
}
