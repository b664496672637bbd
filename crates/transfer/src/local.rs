//! Native copy into a directory on the local machine.
//!
//! Used when the archive destination is a mounted filesystem. No external
//! tools are involved: files are copied with `tokio::fs` and hashed in a
//! blocking task.

use crate::error::{ErrorKind, Result};
use crate::{Copier, Manifest, RemoteChecksums, path::validate as validate_path};
use async_trait::async_trait;
use exn::ResultExt;
use std::ffi::OsString;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;
use suprsync_checksum::Checksum;
use tokio::fs;

/// Copies files natively into `basedir`.
///
/// # Examples
///
/// ```no_run
/// use suprsync_checksum::Checksum;
/// use suprsync_transfer::LocalCopier;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let copier = LocalCopier::new("/mnt/archive/timestreams", Checksum::Md5)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalCopier {
    basedir: PathBuf,
    checksum: Checksum,
}

impl LocalCopier {
    /// Create a copier writing below `basedir`, which must be absolute.
    ///
    /// The directory is created if it does not exist yet.
    pub fn new(basedir: impl AsRef<Path>, checksum: Checksum) -> Result<Self> {
        let basedir = basedir.as_ref().to_path_buf();
        if !basedir.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(basedir));
        }
        if basedir.exists() && !basedir.is_dir() {
            exn::bail!(ErrorKind::InvalidPath(basedir));
        }
        // Only happens once at startup; not worth an async constructor.
        sync_create_dir(&basedir).or_raise(|| ErrorKind::Io)?;
        Ok(Self { basedir, checksum })
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Copy into a hidden sibling first, then rename into place, so a
    /// half-written file never sits at the final path.
    async fn copy_one(&self, local: &Path, remote: &Path) -> Result<u64> {
        let dest = self.basedir.join(remote);
        let parent = dest.parent().unwrap_or(&self.basedir);
        fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
        let mut partial = OsString::from(".");
        partial.push(dest.file_name().unwrap_or_default());
        partial.push(".partial");
        let partial = parent.join(partial);
        let bytes = fs::copy(local, &partial).await.or_raise(|| ErrorKind::Io)?;
        fs::rename(&partial, &dest).await.or_raise(|| ErrorKind::Io)?;
        Ok(bytes)
    }

    async fn transfer_all(&self, manifest: &Manifest) -> Result<u64> {
        let mut total = 0;
        for entry in manifest {
            total += self.copy_one(&entry.local, &entry.remote).await?;
        }
        Ok(total)
    }

    async fn checksum_all(&self, remote_paths: &[PathBuf]) -> RemoteChecksums {
        let mut checksums = RemoteChecksums::new();
        for remote in remote_paths {
            let Ok(remote) = validate_path(remote) else {
                tracing::warn!(path = %remote.display(), "Skipping checksum of invalid remote path");
                continue;
            };
            let algorithm = self.checksum;
            let absolute = self.basedir.join(&remote);
            match tokio::task::spawn_blocking(move || algorithm.hash_file(absolute)).await {
                Ok(Ok(digest)) => {
                    checksums.insert(remote, digest);
                },
                Ok(Err(e)) => tracing::debug!(path = %remote.display(), error = ?e, "Remote checksum undeterminable"),
                Err(e) => tracing::warn!(path = %remote.display(), error = %e, "Checksum task failed"),
            }
        }
        checksums
    }
}

#[async_trait]
impl Copier for LocalCopier {
    fn name(&self) -> &str {
        "local"
    }

    fn destination(&self) -> String {
        self.basedir.display().to_string()
    }

    async fn transfer(&self, manifest: &Manifest, timeout: Option<Duration>) -> Result<()> {
        let bytes = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.transfer_all(manifest))
                .await
                .map_err(|_| exn::Exn::from(ErrorKind::Timeout(limit)))??,
            None => self.transfer_all(manifest).await?,
        };
        tracing::debug!(files = manifest.len(), bytes, destination = %self.basedir.display(), "Copied batch");
        Ok(())
    }

    async fn checksum(&self, remote_paths: &[PathBuf], timeout: Option<Duration>) -> Result<RemoteChecksums> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.checksum_all(remote_paths))
                .await
                .map_err(|_| exn::Exn::from(ErrorKind::Timeout(limit))),
            None => Ok(self.checksum_all(remote_paths).await),
        }
    }
}
