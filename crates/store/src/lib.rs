//! Persistent state of the sync engine.
//!
//! A single SQLite file holds two tables:
//! - **files**: one [`FileRecord`](models::FileRecord) per file that must end
//!   up, byte-identical, in a remote archive. Records are never deleted; they
//!   are kept for audit after the local copy is removed.
//! - **timecode_dirs**: one [`TimecodeDir`](models::TimecodeDir) per time
//!   bucket of an archive, tracking whether it is closed, fully copied and
//!   finalized.
//!
//! The store is the only state the daemon has. Everything in flight (what to
//! copy, what to delete, which buckets to finalize) is re-derived from it
//! after a restart.

mod db;
pub mod error;
pub mod models;
mod repo;
pub mod timecode;

pub use crate::db::Database;
pub use crate::repo::Repository;
pub use crate::timecode::TimecodeScheme;
