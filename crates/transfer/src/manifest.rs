use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One file to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Absolute path of the source file.
    pub local: PathBuf,
    /// Validated destination, relative to the copier's base directory.
    pub remote: PathBuf,
}

/// The exact local-to-remote mapping of one copy batch.
///
/// Every remote path appears at most once, so a batch can be staged as a
/// single directory tree and transferred in one invocation.
#[derive(Debug, Default, Clone)]
pub struct Manifest {
    entries: Vec<Entry>,
    remotes: HashSet<PathBuf>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the batch, returning its normalized remote path.
    ///
    /// Fails with [`ErrorKind::InvalidPath`] for remote paths that escape the
    /// base directory, and with [`ErrorKind::DuplicateRemote`] when another
    /// entry already targets the same destination.
    pub fn push(&mut self, local: impl Into<PathBuf>, remote: impl AsRef<Path>) -> Result<PathBuf> {
        let remote = validate_path(remote)?;
        if !self.remotes.insert(remote.clone()) {
            exn::bail!(ErrorKind::DuplicateRemote(remote));
        }
        self.entries.push(Entry { local: local.into(), remote: remote.clone() });
        Ok(remote)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn remote_paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.remote.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;
    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
