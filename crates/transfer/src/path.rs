//! Remote path validation.
//!
//! Remote paths are relative to the archive's base directory. They end up as
//! symlink names in a staging directory, as rsync arguments, and as arguments
//! to a checksum command on the far side of an SSH connection, so they must
//! never leave the base directory and must survive a round-trip through
//! line-oriented checksum output.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validate and normalize a remote path.
///
/// `.` components and repeated or trailing slashes are dropped, and `..` is
/// resolved as long as it stays inside the base directory. A leading `/` is
/// tolerated and stripped: remote paths are always relative.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use suprsync_transfer::validate_remote_path;
///
/// assert_eq!(validate_remote_path("17145/./sat1//obs.g3").unwrap(), Path::new("17145/sat1/obs.g3"));
/// assert_eq!(validate_remote_path("/17145/obs.g3").unwrap(), Path::new("17145/obs.g3"));
/// assert!(validate_remote_path("../outside.g3").is_err());
/// assert!(validate_remote_path("17145/line\nbreak.g3").is_err());
/// assert!(validate_remote_path("17145/back\\slash.g3").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(path.to_path_buf());
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => {
                // NUL truncates C strings; backslashes, newlines and carriage
                // returns make md5sum escape the name, which then no longer matches.
                if s.as_encoded_bytes().iter().any(|b| matches!(b, b'\0' | b'\n' | b'\r' | b'\\')) {
                    exn::bail!(invalid());
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
        }
    }
    if components.is_empty() {
        exn::bail!(invalid());
    }
    Ok(components.into_iter().collect())
}
