//! Copy mechanisms for the sync engine.
//!
//! A [`Copier`] moves a [`Manifest`] of files into a destination base
//! directory, and independently reports the checksum of files at the
//! destination. The engine only ever trusts the second half: a file is
//! considered copied when its remote checksum matches, regardless of what
//! the transfer claimed.
//!
//! - [`LocalCopier`]: native copy into a directory on this machine.
//! - [`RsyncCopier`] (unix only): one `rsync` invocation per batch
//!   (optionally over SSH), checksums via `md5sum`/`b3sum` on the destination
//!   host. Batches are staged as symlinks.
//! - `MockCopier` (feature `mock`): in-memory destination with injectable
//!   failures, for tests.

pub mod error;
mod local;
mod manifest;
#[cfg(feature = "mock")]
mod mock;
mod path;
#[cfg(unix)]
mod process;
#[cfg(unix)]
mod rsync;

pub use crate::local::LocalCopier;
pub use crate::manifest::{Entry, Manifest};
#[cfg(feature = "mock")]
pub use crate::mock::{Failure, MockCopier};
pub use crate::path::validate as validate_remote_path;
#[cfg(unix)]
pub use crate::rsync::{RsyncCopier, RsyncOptions};

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub type CopierHandle = Arc<dyn Copier + Send + Sync>;

/// Remote checksums keyed by (normalized) remote path.
///
/// Paths whose checksum could not be determined are simply absent.
pub type RemoteChecksums = HashMap<PathBuf, String>;

/// A swappable copy mechanism.
///
/// Implementations must bound every external command by the given timeout
/// and must not leave child processes behind when a call is cancelled.
#[async_trait]
pub trait Copier: Send + Sync {
    /// Short name of the mechanism, for logs.
    fn name(&self) -> &str;

    /// Human-readable destination, for logs.
    fn destination(&self) -> String;

    /// Transfer every manifest entry to its remote path.
    ///
    /// # Errors
    /// - [`Timeout`](crate::error::ErrorKind::Timeout) if the transfer did not
    ///   finish in time.
    /// - [`Failed`](crate::error::ErrorKind::Failed) on a non-zero exit.
    ///
    /// On error, nothing is known about which files arrived.
    async fn transfer(&self, manifest: &Manifest, timeout: Option<Duration>) -> Result<()>;

    /// Checksum files at the destination.
    ///
    /// Paths that are missing, unreadable, or whose output cannot be parsed
    /// are left out of the result rather than reported as errors.
    async fn checksum(&self, remote_paths: &[PathBuf], timeout: Option<Duration>) -> Result<RemoteChecksums>;
}
