//! The sync engines and the loop that drives them.
//!
//! - [`CopyEngine`]: copy a bounded batch of pending files and commit only
//!   what an independent remote checksum confirms.
//! - [`RetentionEngine`]: delete local copies once they are verified remotely.
//! - [`Finalizer`]: close time buckets and advance the finalized watermark.
//! - [`Daemon`]: run the three on a timer, counting failures instead of dying
//!   from them.
//!
//! All engines share one [`Repository`](suprsync_store::Repository) handle
//! and a [`CopierHandle`](suprsync_transfer::CopierHandle); none of them
//! keeps state of its own between calls.

mod copy;
mod daemon;
pub mod error;
mod finalize;
mod retention;
pub mod stats;

pub use crate::copy::{CopyEngine, CopyReport, CopySettings, FileFailure};
pub use crate::daemon::{Daemon, DaemonSettings};
pub use crate::finalize::{FinalizeReport, FinalizeSettings, Finalizer, Marker};
pub use crate::retention::{DeleteReport, RetentionEngine};
