use crate::Checksum;
use crate::error::{Error, ErrorKind};
use std::str::FromStr;

impl FromStr for Checksum {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" | "md5sum" => Ok(Checksum::Md5),
            "b3" | "blake3" | "b3sum" => Ok(Checksum::Blake3),
            _ => exn::bail!(ErrorKind::UnsupportedAlgorithm(s.to_string())),
        }
    }
}
