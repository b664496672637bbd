//! In-memory copier for testing.

use crate::error::{ErrorKind, Result};
use crate::{Copier, Manifest, RemoteChecksums, path::validate as validate_path};
use async_trait::async_trait;
use exn::ResultExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use suprsync_checksum::Checksum;
use tokio::sync::RwLock;

/// A failure to inject into the next transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Behave as if the copy command hung until its timeout.
    Timeout,
    /// Behave as if the copy command exited with this status.
    NonZero(i32),
    /// Copy the files, then report a non-zero exit anyway.
    NonZeroAfterCopy(i32),
}

#[derive(Default)]
struct State {
    remote: HashMap<PathBuf, Vec<u8>>,
    failures: VecDeque<Failure>,
    corrupted: HashSet<PathBuf>,
    corrupt_all: bool,
    hidden: HashSet<PathBuf>,
    transfers: usize,
    files_sent: usize,
}

/// Copier with an in-memory destination.
///
/// Files are read from the local filesystem and stored in a map keyed by
/// remote path. Failures and corrupted remote checksums can be injected to
/// exercise the engine's error handling without real subprocesses.
///
/// # Examples
///
/// ```
/// use suprsync_transfer::{Copier, Failure, Manifest, MockCopier};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let copier = MockCopier::default();
/// copier.fail_next(Failure::Timeout).await;
/// assert!(copier.transfer(&Manifest::new(), None).await.is_err());
/// assert!(copier.transfer(&Manifest::new(), None).await.is_ok());
/// # }
/// ```
#[derive(Default)]
pub struct MockCopier {
    checksum: Checksum,
    state: RwLock<State>,
}

impl MockCopier {
    pub fn new(checksum: Checksum) -> Self {
        Self { checksum, state: RwLock::default() }
    }

    /// Queue a failure; each transfer consumes at most one.
    pub async fn fail_next(&self, failure: Failure) {
        self.state.write().await.failures.push_back(failure);
    }

    /// Report a wrong checksum for this remote path from now on.
    pub async fn corrupt(&self, remote: impl AsRef<Path>) {
        let remote = validate_path(remote).unwrap_or_else(|e| panic!("MockCopier::corrupt: {e:?}"));
        self.state.write().await.corrupted.insert(remote);
    }

    /// Report a wrong checksum for every path.
    pub async fn corrupt_all(&self, corrupt: bool) {
        self.state.write().await.corrupt_all = corrupt;
    }

    /// Make the checksum of this remote path undeterminable.
    pub async fn hide(&self, remote: impl AsRef<Path>) {
        let remote = validate_path(remote).unwrap_or_else(|e| panic!("MockCopier::hide: {e:?}"));
        self.state.write().await.hidden.insert(remote);
    }

    /// Contents stored at a remote path.
    pub async fn get(&self, remote: impl AsRef<Path>) -> Option<Vec<u8>> {
        let remote = validate_path(remote).ok()?;
        self.state.read().await.remote.get(&remote).cloned()
    }

    /// All remote paths, sorted.
    pub async fn remote_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.state.read().await.remote.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of transfer calls that reached the copy stage.
    pub async fn transfers(&self) -> usize {
        self.state.read().await.transfers
    }

    /// Number of files sent across all transfers.
    pub async fn files_sent(&self) -> usize {
        self.state.read().await.files_sent
    }

    async fn send(&self, manifest: &Manifest) -> Result<()> {
        let mut files = Vec::with_capacity(manifest.len());
        for entry in manifest {
            let data = tokio::fs::read(&entry.local).await.or_raise(|| ErrorKind::Io)?;
            files.push((entry.remote.clone(), data));
        }
        let mut state = self.state.write().await;
        state.transfers += 1;
        state.files_sent += files.len();
        state.remote.extend(files);
        Ok(())
    }
}

#[async_trait]
impl Copier for MockCopier {
    fn name(&self) -> &str {
        "mock"
    }

    fn destination(&self) -> String {
        "memory".to_string()
    }

    async fn transfer(&self, manifest: &Manifest, timeout: Option<Duration>) -> Result<()> {
        let failure = self.state.write().await.failures.pop_front();
        match failure {
            Some(Failure::Timeout) => exn::bail!(ErrorKind::Timeout(timeout.unwrap_or_default())),
            Some(Failure::NonZero(code)) => exn::bail!(ErrorKind::Failed(Some(code))),
            Some(Failure::NonZeroAfterCopy(code)) => {
                self.send(manifest).await?;
                exn::bail!(ErrorKind::Failed(Some(code)));
            },
            None => self.send(manifest).await,
        }
    }

    async fn checksum(&self, remote_paths: &[PathBuf], _timeout: Option<Duration>) -> Result<RemoteChecksums> {
        let state = self.state.read().await;
        let mut checksums = RemoteChecksums::new();
        for remote in remote_paths {
            let Ok(remote) = validate_path(remote) else {
                continue;
            };
            if state.hidden.contains(&remote) {
                continue;
            }
            let Some(data) = state.remote.get(&remote) else {
                continue;
            };
            let digest = if state.corrupt_all || state.corrupted.contains(&remote) {
                let mut flipped = data.clone();
                flipped.push(0xff);
                self.checksum.hash_bytes(&flipped)
            } else {
                self.checksum.hash_bytes(data)
            };
            checksums.insert(remote, digest);
        }
        Ok(checksums)
    }
}
