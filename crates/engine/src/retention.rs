//! Retention Engine: free local disk space once a verified copy exists.

use crate::error::{ErrorKind, Result};
use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;
use suprsync_store::Repository;
use suprsync_store::models::Removal;
use time::UtcDateTime;
use tracing::{debug, info, instrument, warn};

/// What one retention pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    /// Deleted by this pass.
    pub removed: Vec<i64>,
    /// Already missing locally; recorded as gone.
    pub already_gone: Vec<i64>,
    /// Could not be deleted (e.g. permission denied); retried next pass.
    pub skipped: Vec<i64>,
}

impl DeleteReport {
    /// Records whose `removed_at` was set by this pass.
    pub fn recorded(&self) -> usize {
        self.removed.len() + self.already_gone.len()
    }
}

#[derive(Clone)]
pub struct RetentionEngine {
    repo: Repository,
}

impl RetentionEngine {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Delete local copies of files that are verified remotely, deletable,
    /// and older than `grace`.
    pub async fn delete_batch(&self, archive: &str, grace: Duration) -> Result<DeleteReport> {
        self.delete_batch_at(archive, grace, UtcDateTime::now()).await
    }

    /// [`delete_batch`](Self::delete_batch) with an explicit clock.
    #[instrument(skip(self))]
    pub async fn delete_batch_at(&self, archive: &str, grace: Duration, now: UtcDateTime) -> Result<DeleteReport> {
        let candidates = self.repo.deletable_at(archive, grace, now).await.map_err(ErrorKind::store)?;
        let mut report = DeleteReport::default();
        let mut removals = Vec::with_capacity(candidates.len());
        for record in candidates {
            // The store query already filters, but the local file is about to
            // go away for good.
            if !record.is_deletable_at(now, grace) {
                continue;
            }
            match tokio::fs::remove_file(&record.local_path).await {
                Ok(()) => {
                    debug!(id = record.id, path = %record.local_path.display(), "Removed local file");
                    removals.push((record.id, Removal::At(now)));
                    report.removed.push(record.id);
                },
                Err(err) if err.kind() == IoErrorKind::NotFound => {
                    debug!(id = record.id, path = %record.local_path.display(), "Local file already gone");
                    removals.push((record.id, Removal::AlreadyGone));
                    report.already_gone.push(record.id);
                },
                Err(err) => {
                    warn!(id = record.id, path = %record.local_path.display(), error = %err, "Could not remove local file");
                    report.skipped.push(record.id);
                },
            }
        }
        if !removals.is_empty() {
            self.repo.mark_removed(&removals).await.map_err(ErrorKind::store)?;
        }
        if report.recorded() > 0 || !report.skipped.is_empty() {
            info!(
                removed = report.removed.len(),
                already_gone = report.already_gone.len(),
                skipped = report.skipped.len(),
                "Retention pass finished"
            );
        }
        Ok(report)
    }
}
