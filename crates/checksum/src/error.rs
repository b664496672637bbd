//! Checksum Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A checksum error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for checksum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested algorithm is not supported.
    #[display("unsupported checksum algorithm: {_0}")]
    UnsupportedAlgorithm(#[error(not(source))] String),
    /// The file could not be opened or read.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io)
    }
}
