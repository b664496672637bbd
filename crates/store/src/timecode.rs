//! Time buckets ("timecodes").
//!
//! Archives that are organized by time put every file under a top-level
//! directory named after a coarse time window, e.g. `17145/` for all files
//! written between `1714500000` and `1714599999`. The scheme decides the
//! window width and which directory names count as bucket directories.

use crate::error::{ErrorKind, Result};
use std::path::Path;
use time::UtcDateTime;

/// Window width used by the acquisition agents: five-digit directory names.
pub const DEFAULT_WIDTH: u64 = 100_000;
pub const DEFAULT_DIGITS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimecodeScheme {
    width: u64,
    digits: Option<usize>,
}

impl Default for TimecodeScheme {
    fn default() -> Self {
        Self { width: DEFAULT_WIDTH, digits: Some(DEFAULT_DIGITS) }
    }
}

impl TimecodeScheme {
    /// Create a scheme with a window of `width` seconds.
    ///
    /// When `digits` is set, only directory names of exactly that many decimal
    /// digits are treated as buckets.
    pub fn new(width: u64, digits: Option<usize>) -> Result<Self> {
        if width == 0 || i64::try_from(width).is_err() {
            exn::bail!(ErrorKind::InvalidData("bucket width"));
        }
        if digits == Some(0) {
            exn::bail!(ErrorKind::InvalidData("bucket digits"));
        }
        Ok(Self { width, digits })
    }

    #[must_use]
    pub fn width(&self) -> u64 {
        self.width
    }

    #[inline]
    fn width_i64(&self) -> i64 {
        // Guarded by the constructor.
        self.width as i64
    }

    /// Bucket containing the given instant: `floor(timestamp / width)`.
    #[must_use]
    pub fn bucket_of(&self, at: UtcDateTime) -> i64 {
        at.unix_timestamp().div_euclid(self.width_i64())
    }

    /// First second belonging to `bucket`, as a unix timestamp.
    #[must_use]
    pub fn start_of(&self, bucket: i64) -> i64 {
        bucket.saturating_mul(self.width_i64())
    }

    /// First second *after* `bucket`. Everything in the bucket happened
    /// strictly before this.
    #[must_use]
    pub fn end_of(&self, bucket: i64) -> i64 {
        bucket.saturating_add(1).saturating_mul(self.width_i64())
    }

    /// Parse a directory name as a bucket id.
    #[must_use]
    pub fn parse(&self, name: &str) -> Option<i64> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if let Some(digits) = self.digits
            && name.len() != digits
        {
            return None;
        }
        name.parse().ok()
    }

    /// Bucket of a file, taken from the first directory of its remote path.
    ///
    /// A bare file name (no directory) is not in any bucket.
    #[must_use]
    pub fn from_remote_path(&self, remote_path: &str) -> Option<i64> {
        let (first, rest) = remote_path.trim_start_matches('/').split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        self.parse(first)
    }

    /// Bucket of a local directory, from its final path component.
    #[must_use]
    pub fn from_dir(&self, dir: &Path) -> Option<i64> {
        dir.file_name().and_then(|name| name.to_str()).and_then(|name| self.parse(name))
    }

    /// Directory name for a bucket, zero-padded to the configured digit count.
    #[must_use]
    pub fn dir_name(&self, bucket: i64) -> String {
        match self.digits {
            Some(digits) => format!("{bucket:0digits$}"),
            None => bucket.to_string(),
        }
    }
}
