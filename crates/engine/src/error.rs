//! Engine Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! The set is deliberately closed: the daemon pattern-matches on it to decide
//! what to count and what to propagate.

use derive_more::{Display, Error};
use suprsync_store::error::Error as StoreError;
use suprsync_transfer::error::{Error as TransferError, ErrorKind as TransferErrorKind};

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The copy or checksum command hit its timeout. Retried next tick.
    #[display("transfer timed out")]
    TransferTimeout,
    /// The copy or checksum command failed (non-zero exit, staging error).
    /// Retried next tick.
    #[display("transfer failed")]
    TransferFailed,
    /// A file's remote checksum was determined and does not match.
    #[display("remote checksum does not match")]
    VerificationMismatch,
    /// The store cannot be read or written. Fatal to the daemon.
    #[display("file record store unavailable")]
    StoreUnavailable,
    /// Local filesystem error.
    #[display("I/O error")]
    Io,
    /// A bucket's completion marker could not be written or registered.
    #[display("could not write completion marker")]
    Marker,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::StoreUnavailable)
    }

    /// Wrap a copier error, keeping its frame as a child of the engine error.
    #[track_caller]
    pub(crate) fn transfer(err: TransferError) -> Error {
        let kind = match &*err {
            TransferErrorKind::Timeout(_) => Self::TransferTimeout,
            _ => Self::TransferFailed,
        };
        err.raise(kind)
    }

    #[track_caller]
    pub(crate) fn store(err: StoreError) -> Error {
        err.raise(Self::StoreUnavailable)
    }
}
