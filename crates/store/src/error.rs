//! Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The database could not be reached, or a statement failed. There is no
    /// degraded mode without the store.
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A file being registered could not be read; no record was created.
    #[display("unreadable file: {}", _0.display())]
    Unreadable(#[error(not(source))] PathBuf),
    /// No record of the given kind with this id.
    #[display("{_0} {_1} not found")]
    NotFound(#[error(not(source))] &'static str, i64),
    /// A value could not be converted to or from its stored representation.
    #[display("invalid store data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Database | ErrorKind::Unreadable(_))
    }
}
