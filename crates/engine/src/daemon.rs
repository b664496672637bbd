//! Sync Daemon Loop: drive the engines until told to stop.

use crate::copy::{CopyEngine, CopyReport};
use crate::error::{ErrorKind, Result};
use crate::finalize::Finalizer;
use crate::retention::RetentionEngine;
use crate::stats::{Activity, Counters, LastCopy, Snapshot, StatsSink, TracingSink};
use std::sync::Arc;
use std::time::Duration;
use suprsync_store::Repository;
use time::UtcDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub archive: String,
    /// Pause between ticks.
    pub sleep_time: Duration,
    /// Grace period before copied files are deleted locally; never when `None`.
    pub delete_after: Option<Duration>,
    /// Minimum time between finalization passes.
    pub finalize_interval: Duration,
}

impl DaemonSettings {
    pub fn new(archive: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            sleep_time: Duration::from_secs(60),
            delete_after: None,
            finalize_interval: Duration::from_secs(3600),
        }
    }
}

/// One copy/finalize/delete loop for one archive and destination.
///
/// Holds no state that matters across restarts: everything in flight is
/// re-derived from the store on every tick. Only the session counters are
/// lost when the process exits.
pub struct Daemon {
    repo: Repository,
    copy: CopyEngine,
    retention: RetentionEngine,
    finalizer: Option<Finalizer>,
    settings: DaemonSettings,
    sink: Arc<dyn StatsSink>,
    counters: Counters,
    last_copy: Option<LastCopy>,
    last_finalize: Option<Instant>,
}

impl Daemon {
    pub fn new(repo: Repository, copy: CopyEngine, settings: DaemonSettings) -> Self {
        Self {
            retention: RetentionEngine::new(repo.clone()),
            repo,
            copy,
            finalizer: None,
            settings,
            sink: Arc::new(TracingSink),
            counters: Counters::default(),
            last_copy: None,
            last_finalize: None,
        }
    }

    #[must_use]
    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    fn publish(&self, activity: Activity, archive: suprsync_store::models::ArchiveStats) -> Snapshot {
        let snapshot = Snapshot { counters: self.counters, activity, last_copy: self.last_copy.clone(), archive };
        self.sink.publish(&snapshot);
        snapshot
    }

    fn count_copy(&mut self, report: &CopyReport) {
        let mismatched = report.mismatched() as u64;
        self.counters.copies += report.verified.len() as u64;
        self.counters.errors_mismatch += mismatched;
        self.counters.errors_other += report.failures.len() as u64 - mismatched;
    }

    /// Count a batch-level error. Only [`StoreUnavailable`](ErrorKind::StoreUnavailable)
    /// is handed back.
    fn count_error(&mut self, err: crate::error::Error) -> Result<()> {
        match *err {
            ErrorKind::StoreUnavailable => return Err(err),
            ErrorKind::TransferTimeout => self.counters.errors_timeout += 1,
            ErrorKind::TransferFailed => self.counters.errors_nonzero += 1,
            _ => self.counters.errors_other += 1,
        }
        warn!(error = ?err, "Copy batch failed; retrying next tick");
        Ok(())
    }

    async fn copy_step(&mut self) -> Result<()> {
        let start = UtcDateTime::now();
        let result = self.copy.copy_batch(&self.settings.archive).await;
        let stop = UtcDateTime::now();
        let (files, error) = match result {
            Ok(report) if report.is_empty() => return Ok(()),
            Ok(report) => {
                self.count_copy(&report);
                (report.transferred, None)
            },
            Err(err) => {
                let message = (*err).to_string();
                self.count_error(err)?;
                (0, Some(message))
            },
        };
        self.last_copy = Some(LastCopy { start_time: unix_secs(start), stop_time: unix_secs(stop), files, error });
        Ok(())
    }

    async fn finalize_step(&mut self) -> Result<()> {
        let Some(finalizer) = &self.finalizer else {
            return Ok(());
        };
        if self.last_finalize.is_some_and(|at| at.elapsed() < self.settings.finalize_interval) {
            return Ok(());
        }
        let report = finalizer.update_timecode_dirs().await?;
        self.last_finalize = Some(Instant::now());
        if let Some(copy) = &report.copy {
            self.count_copy(copy);
        }
        match report.copy_error {
            Some(ErrorKind::TransferTimeout) => self.counters.errors_timeout += 1,
            Some(ErrorKind::TransferFailed) => self.counters.errors_nonzero += 1,
            Some(_) => self.counters.errors_other += 1,
            None => {},
        }
        self.counters.errors_other += report.marker_errors.len() as u64;
        Ok(())
    }

    /// Run one iteration: copy, finalize (when due), collect stats, delete.
    ///
    /// # Errors
    /// Only [`StoreUnavailable`](ErrorKind::StoreUnavailable); everything
    /// else is logged, counted and retried next tick.
    #[instrument(skip(self), fields(archive = %self.settings.archive, iteration = self.counters.iterations))]
    pub async fn tick(&mut self) -> Result<Snapshot> {
        self.sink.publish(&Snapshot { activity: Activity::Copying, ..self.idle_snapshot() });
        self.copy_step().await?;

        if self.finalizer.is_some() {
            self.sink.publish(&Snapshot { activity: Activity::Finalizing, ..self.idle_snapshot() });
            self.finalize_step().await?;
        }

        let max_attempts = self.copy.settings().max_attempts;
        let archive = self.repo.archive_stats(&self.settings.archive, max_attempts).await.map_err(ErrorKind::store)?;
        if archive.exhausted_files > 0 {
            warn!(exhausted = archive.exhausted_files, "Files exceeded their copy attempts and need attention");
        }

        if let Some(grace) = self.settings.delete_after {
            self.sink.publish(&Snapshot { activity: Activity::Deleting, archive: archive.clone(), ..self.idle_snapshot() });
            let report = self.retention.delete_batch(&self.settings.archive, grace).await?;
            self.counters.files_removed += report.recorded() as u64;
        }

        self.counters.iterations += 1;
        Ok(self.publish(Activity::Idle, archive))
    }

    fn idle_snapshot(&self) -> Snapshot {
        Snapshot { counters: self.counters, activity: Activity::Idle, last_copy: self.last_copy.clone(), ..Default::default() }
    }

    /// Tick until `cancel` fires.
    ///
    /// Cancellation interrupts the sleep between ticks; a running tick is
    /// allowed to finish, which is bounded by the copier timeouts.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(archive = %self.settings.archive, sleep = ?self.settings.sleep_time, "Sync daemon started");
        while !cancel.is_cancelled() {
            if let Err(err) = self.tick().await {
                error!(error = ?err, "Store unavailable; stopping");
                return Err(err);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stop requested");
                },
                _ = tokio::time::sleep(self.settings.sleep_time) => {},
            }
        }
        info!(iterations = self.counters.iterations, "Sync daemon stopped");
        Ok(())
    }
}

fn unix_secs(at: UtcDateTime) -> f64 {
    (at.unix_timestamp_nanos() as f64) / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::CopySettings;
    use crate::stats::WatchSink;
    use suprsync_store::Database;
    use suprsync_store::models::NewFile;
    use suprsync_transfer::{Failure, MockCopier};

    const ARCHIVE: &str = "test";

    async fn daemon(copier: Arc<MockCopier>, repo: &Repository) -> Daemon {
        let copy = CopyEngine::new(repo.clone(), copier, CopySettings { max_attempts: Some(2), ..Default::default() });
        let settings = DaemonSettings {
            sleep_time: Duration::from_millis(10),
            delete_after: Some(Duration::ZERO),
            ..DaemonSettings::new(ARCHIVE)
        };
        Daemon::new(repo.clone(), copy, settings)
    }

    #[tokio::test]
    async fn test_errors_are_counted_not_raised() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.g3");
        tokio::fs::write(&path, b"a").await.unwrap();
        repo.register(NewFile::new(&path, "a.g3", ARCHIVE)).await.unwrap();

        let copier = Arc::new(MockCopier::default());
        copier.fail_next(Failure::Timeout).await;
        copier.fail_next(Failure::NonZero(12)).await;
        let mut daemon = daemon(copier.clone(), &repo).await;

        let snapshot = daemon.tick().await.unwrap();
        assert_eq!(snapshot.counters.errors_timeout, 1);
        assert_eq!(snapshot.archive.uncopied_files, 1);
        assert_eq!(snapshot.last_copy.as_ref().unwrap().error.as_deref(), Some("transfer timed out"));
        let snapshot = daemon.tick().await.unwrap();
        assert_eq!(snapshot.counters.errors_nonzero, 1);

        let snapshot = daemon.tick().await.unwrap();
        assert_eq!(snapshot.counters.copies, 1);
        assert_eq!(snapshot.counters.files_removed, 1);
        assert_eq!(snapshot.counters.iterations, 3);
        assert_eq!(snapshot.archive.uncopied_files, 0);
        assert!(snapshot.last_copy.unwrap().error.is_none());
        assert!(!path.exists());
        db.close().await;
    }

    #[tokio::test]
    async fn test_mismatches_surface_as_exhausted() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.g3");
        tokio::fs::write(&path, b"a").await.unwrap();
        repo.register(NewFile::new(&path, "a.g3", ARCHIVE)).await.unwrap();
        let copier = Arc::new(MockCopier::default());
        copier.corrupt_all(true).await;
        let mut daemon = daemon(copier, &repo).await;

        for _ in 0..3 {
            daemon.tick().await.unwrap();
        }
        let counters = daemon.counters();
        assert_eq!(counters.errors_mismatch, 2);
        assert_eq!(counters.files_removed, 0);
        let snapshot = daemon.tick().await.unwrap();
        assert_eq!(snapshot.archive.exhausted_files, 1);
        assert!(path.exists());
        db.close().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let (sink, mut receiver) = WatchSink::new();
        let mut daemon = daemon(Arc::new(MockCopier::default()), &repo).await.with_sink(Arc::new(sink));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let watcher = tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                if receiver.borrow().counters.iterations >= 3 {
                    break;
                }
            }
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(10), daemon.run(cancel)).await.unwrap().unwrap();
        watcher.await.unwrap();
        assert!(daemon.counters().iterations >= 3);
        db.close().await;
    }

    #[tokio::test]
    async fn test_store_loss_is_fatal() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        let mut daemon = daemon(Arc::new(MockCopier::default()), &repo).await;
        db.close().await;
        let err = daemon.tick().await.unwrap_err();
        assert_eq!(*err, ErrorKind::StoreUnavailable);
        let err = daemon.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(*err, ErrorKind::StoreUnavailable);
    }
}
