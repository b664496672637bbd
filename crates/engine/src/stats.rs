//! Per-tick statistics and where they go.

use serde::Serialize;
use suprsync_store::models::ArchiveStats;
use tokio::sync::watch;

/// Session counters. Reset only when the daemon restarts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub iterations: u64,
    /// Files verified on the remote side.
    pub copies: u64,
    pub errors_timeout: u64,
    pub errors_nonzero: u64,
    /// Files whose remote checksum did not match.
    pub errors_mismatch: u64,
    pub errors_other: u64,
    pub files_removed: u64,
}

/// What the daemon is doing right now.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    #[default]
    Idle,
    Copying,
    Finalizing,
    Deleting,
}

/// The most recent copy batch that had anything to do.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LastCopy {
    /// Unix seconds.
    pub start_time: f64,
    /// Unix seconds.
    pub stop_time: f64,
    pub files: usize,
    pub error: Option<String>,
}

/// Everything published after a tick.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub counters: Counters,
    pub activity: Activity,
    pub last_copy: Option<LastCopy>,
    pub archive: ArchiveStats,
}

/// Receives a [`Snapshot`] at the end of every tick.
///
/// Publishing must not block the daemon; sinks that talk to the network are
/// expected to hand the snapshot off.
pub trait StatsSink: Send + Sync {
    fn publish(&self, snapshot: &Snapshot);
}

/// Logs every snapshot as a structured event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatsSink for TracingSink {
    fn publish(&self, snapshot: &Snapshot) {
        let Snapshot { counters, archive, .. } = snapshot;
        tracing::info!(
            archive = %archive.archive_name,
            iterations = counters.iterations,
            copies = counters.copies,
            errors_timeout = counters.errors_timeout,
            errors_nonzero = counters.errors_nonzero,
            errors_mismatch = counters.errors_mismatch,
            errors_other = counters.errors_other,
            files_removed = counters.files_removed,
            num_files = archive.num_files,
            uncopied_files = archive.uncopied_files,
            uncopied_bytes = archive.uncopied_bytes,
            exhausted_files = archive.exhausted_files,
            finalized_until = ?archive.finalized_until,
            "Sync stats"
        );
    }
}

/// Keeps the latest snapshot in a [`watch`] channel for in-process readers.
#[derive(Debug, Clone)]
pub struct WatchSink {
    sender: watch::Sender<Snapshot>,
}

impl WatchSink {
    /// Create a sink and a receiver that always sees the latest snapshot.
    pub fn new() -> (Self, watch::Receiver<Snapshot>) {
        let (sender, receiver) = watch::channel(Snapshot::default());
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.sender.subscribe()
    }
}

impl StatsSink for WatchSink {
    fn publish(&self, snapshot: &Snapshot) {
        // `send_replace` keeps the value even while nobody is subscribed.
        self.sender.send_replace(snapshot.clone());
    }
}
