mod file;
mod stats;
mod timecode;

pub use self::file::{CopyOutcome, FileRecord, NewFile, Removal};
pub(crate) use self::file::FileRow;
pub use self::stats::ArchiveStats;
pub use self::timecode::{TimecodeDir, TimecodeFlags};
pub(crate) use self::timecode::TimecodeDirRow;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use time::UtcDateTime;

/// Timestamps are stored as REAL unix seconds so that sub-second ordering of
/// registrations survives.
pub(crate) fn to_secs(at: UtcDateTime) -> f64 {
    at.unix_timestamp_nanos() as f64 / 1e9
}

pub(crate) fn from_secs(secs: f64) -> Result<UtcDateTime> {
    if !secs.is_finite() {
        exn::bail!(ErrorKind::InvalidData("timestamp"));
    }
    UtcDateTime::from_unix_timestamp_nanos((secs * 1e9).round() as i128)
        .or_raise(|| ErrorKind::InvalidData("timestamp"))
}
