//! Content checksums with a matching remote command.
//!
//! This crate wraps the hashing libraries behind a unified [`Checksum`] enum,
//! providing:
//!
//! - **Local hashing** of files and readers ([`Checksum::hash_file`],
//!   [`Checksum::hash_reader`]), reading the content exactly once
//! - **Remote command names** ([`Checksum::command`]) for tools that produce the
//!   same digest on the destination host
//! - **Output parsing** of `<digest>  <path>` lines produced by those tools
//!   ([`parse_line`])
//!
//! Digests are always lowercase hex strings so they can be compared verbatim
//! against whatever the remote tool prints.

mod construct;
pub mod error;
mod ops;
mod util;

pub use crate::ops::parse_line;

/// A supported checksum algorithm.
///
/// Defaults to [`Md5`](Self::Md5), because `md5sum` is available on virtually
/// every host a file could be copied to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Checksum {
    /// MD5 (`md5sum`)
    #[default]
    Md5,
    /// BLAKE3 (`b3sum`)
    Blake3,
}
