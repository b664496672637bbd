use crate::Checksum;
use std::fmt::{Display, Formatter, Result as FmtResult};

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl AsRef<str> for Checksum {
    fn as_ref(&self) -> &'static str {
        self.as_str()
    }
}

impl Checksum {
    /// Returns the short name for configuration (for displaying to user)
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Checksum::Md5 => "md5",
            Checksum::Blake3 => "blake3",
        }
    }

    /// Name of the coreutils-style executable that prints this digest for
    /// each path argument.
    #[inline]
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Checksum::Md5 => "md5sum",
            Checksum::Blake3 => "b3sum",
        }
    }

    /// Length of the hex digest.
    #[inline]
    #[must_use]
    pub fn hex_len(&self) -> usize {
        match self {
            Checksum::Md5 => 32,
            Checksum::Blake3 => 64,
        }
    }
}
