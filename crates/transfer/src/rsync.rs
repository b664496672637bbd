//! Batch transfer with `rsync`, optionally over SSH.
//!
//! A batch is staged as a temporary directory of symlinks laid out exactly
//! like the destination, then sent with a single `rsync -L` (which follows
//! the links and copies the real contents). Checksums are computed on the
//! destination host by `md5sum` (or `b3sum`) over SSH.

use crate::error::{ErrorKind, Result};
use crate::process::{check, run};
use crate::{Copier, Manifest, RemoteChecksums, path::validate as validate_path};
use async_trait::async_trait;
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use suprsync_checksum::{Checksum, parse_line};
use tokio::process::Command;

/// Where and how to copy.
#[derive(Debug, Clone, Default)]
pub struct RsyncOptions {
    /// Base directory on the destination host.
    pub basedir: PathBuf,
    /// `user@host` to copy to; `None` copies to a local directory.
    pub ssh_host: Option<String>,
    /// Identity file passed to `ssh -i`.
    pub ssh_key: Option<PathBuf>,
    /// Compress during transfer (`rsync -z`).
    pub compression: bool,
    /// Bandwidth limit in KiB/s (`rsync --bwlimit`).
    pub bwlimit: Option<u32>,
    pub checksum: Checksum,
}

/// Copies batches with `rsync` and verifies them with a remote checksum
/// command.
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    rsync: PathBuf,
    /// Only discovered when copying to a remote host.
    ssh: Option<PathBuf>,
    options: RsyncOptions,
}

impl RsyncCopier {
    /// Discover the required executables on `PATH`.
    ///
    /// Needs `rsync`, plus `ssh` for a remote destination or the checksum
    /// tool itself for a local one. The remote host's checksum tool can only
    /// be checked when it is first used.
    pub fn new(options: RsyncOptions) -> Result<Self> {
        let rsync = which::which("rsync").or_raise(|| ErrorKind::ToolNotFound("rsync"))?;
        let ssh = match options.ssh_host {
            Some(_) => Some(which::which("ssh").or_raise(|| ErrorKind::ToolNotFound("ssh"))?),
            None => {
                let tool = options.checksum.command();
                which::which(tool).or_raise(|| ErrorKind::ToolNotFound(tool))?;
                None
            },
        };
        tracing::debug!(rsync = %rsync.display(), ssh = ?ssh, "Discovered transfer tools");
        Ok(Self { rsync, ssh, options })
    }

    /// `host:basedir/` or `basedir/`. The trailing slash makes rsync copy the
    /// staging directory's *contents*.
    fn destination_arg(&self) -> String {
        let basedir = self.options.basedir.display();
        match &self.options.ssh_host {
            Some(host) => format!("{host}:{basedir}/"),
            None => format!("{basedir}/"),
        }
    }

    fn rsync_command(&self, staging: &Path) -> Command {
        let mut command = Command::new(&self.rsync);
        // -L: send the files the symlinks point at, -r: recurse, -t: keep mtimes.
        command.arg("-Lrt");
        if self.options.compression {
            command.arg("-z");
        }
        if let Some(limit) = self.options.bwlimit {
            command.arg(format!("--bwlimit={limit}"));
        }
        if let (Some(ssh), Some(key)) = (&self.ssh, &self.options.ssh_key) {
            command.arg("--rsh").arg(format!("{} -i {}", ssh.display(), shell_quote(&key.to_string_lossy())));
        }
        let mut source = staging.as_os_str().to_owned();
        source.push("/");
        command.arg(source).arg(self.destination_arg());
        command
    }

    fn checksum_command(&self, absolute: &[PathBuf]) -> Command {
        let tool = self.options.checksum.command();
        match (&self.ssh, &self.options.ssh_host) {
            (Some(ssh), Some(host)) => {
                let mut command = Command::new(ssh);
                if let Some(key) = &self.options.ssh_key {
                    command.arg("-i").arg(key);
                }
                // ssh joins its arguments into one string for the remote
                // shell, so each path has to be quoted for that shell.
                command.arg(host).arg(tool);
                command.args(absolute.iter().map(|p| shell_quote(&p.to_string_lossy())));
                command
            },
            _ => {
                let mut command = Command::new(tool);
                command.args(absolute);
                command
            },
        }
    }

    /// Lay the batch out as symlinks under `staging`, mirroring remote paths.
    async fn stage(&self, manifest: &Manifest, staging: &Path) -> Result<()> {
        for entry in manifest {
            let link = staging.join(&entry.remote);
            if let Some(parent) = link.parent() {
                tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
            }
            tokio::fs::symlink(&entry.local, &link).await.or_raise(|| ErrorKind::Io)?;
        }
        Ok(())
    }

    /// Map `md5sum` output back onto the requested remote paths.
    fn parse_checksums(&self, stdout: &str, requested: &[PathBuf]) -> RemoteChecksums {
        let mut checksums = RemoteChecksums::new();
        for line in stdout.lines() {
            let Some((digest, path)) = parse_line(line) else {
                continue;
            };
            if digest.len() != self.options.checksum.hex_len() {
                continue;
            }
            let Ok(relative) = Path::new(path).strip_prefix(&self.options.basedir) else {
                continue;
            };
            if let Some(remote) = requested.iter().find(|r| r.as_path() == relative) {
                checksums.insert(remote.clone(), digest.to_lowercase());
            }
        }
        checksums
    }
}

#[async_trait]
impl Copier for RsyncCopier {
    fn name(&self) -> &str {
        "rsync"
    }

    fn destination(&self) -> String {
        self.destination_arg()
    }

    async fn transfer(&self, manifest: &Manifest, timeout: Option<Duration>) -> Result<()> {
        if manifest.is_empty() {
            return Ok(());
        }
        // Removed (with its symlinks) when dropped, whatever happens below.
        let staging = tempfile::Builder::new().prefix("suprsync-").tempdir().or_raise(|| ErrorKind::Io)?;
        self.stage(manifest, staging.path()).await?;
        if self.options.ssh_host.is_none() {
            tokio::fs::create_dir_all(&self.options.basedir).await.or_raise(|| ErrorKind::Io)?;
        }
        let output = run(self.rsync_command(staging.path()), timeout).await?;
        check(&output)?;
        tracing::debug!(files = manifest.len(), destination = %self.destination_arg(), "rsync batch complete");
        Ok(())
    }

    async fn checksum(&self, remote_paths: &[PathBuf], timeout: Option<Duration>) -> Result<RemoteChecksums> {
        let mut requested = Vec::with_capacity(remote_paths.len());
        for remote in remote_paths {
            match validate_path(remote) {
                Ok(remote) => requested.push(remote),
                Err(_) => tracing::warn!(path = %remote.display(), "Skipping checksum of invalid remote path"),
            }
        }
        if requested.is_empty() {
            return Ok(RemoteChecksums::new());
        }
        let absolute: Vec<PathBuf> = requested.iter().map(|r| self.options.basedir.join(r)).collect();
        let output = run(self.checksum_command(&absolute), timeout).await?;
        // md5sum exits non-zero when *some* files are missing but still prints
        // the rest, so the output is parsed regardless of status.
        if !output.status.success() {
            tracing::debug!(
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Checksum command reported errors"
            );
        }
        Ok(self.parse_checksums(&String::from_utf8_lossy(&output.stdout), &requested))
    }
}

/// Quote a string for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
