//! Transfer Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;
use std::time::Duration;

/// A transfer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The copy or checksum command did not finish in time and was killed.
    #[display("timed out after {_0:?}")]
    Timeout(#[error(not(source))] Duration),
    /// The copy or checksum command exited unsuccessfully. `None` when it was
    /// killed by a signal.
    #[display("command exited with status {}", _0.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed(#[error(not(source))] Option<i32>),
    /// A required executable is not on `PATH`.
    #[display("executable not found: {_0}")]
    ToolNotFound(#[error(not(source))] &'static str),
    /// Remote path is empty, escapes the base directory, or contains
    /// characters the remote tools cannot round-trip.
    #[display("invalid remote path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Two manifest entries share one destination.
    #[display("duplicate remote path: {}", _0.display())]
    DuplicateRemote(#[error(not(source))] PathBuf),
    /// Local filesystem error while staging or copying.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Failed(_) | Self::Io)
    }
}
