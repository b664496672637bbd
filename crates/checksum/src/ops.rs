use crate::Checksum;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const BUFFER_CAPACITY: usize = 64 * 1024;

enum Hasher {
    Md5(Md5),
    Blake3(Box<blake3::Hasher>),
}
impl Hasher {
    fn new(algorithm: Checksum) -> Self {
        match algorithm {
            Checksum::Md5 => Self::Md5(Md5::new()),
            Checksum::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            },
        }
    }

    fn finalize(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

impl Checksum {
    /// Hash an in-memory buffer.
    #[must_use]
    pub fn hash_bytes(&self, data: &[u8]) -> String {
        let mut hasher = Hasher::new(*self);
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash everything a reader yields, without buffering it all in memory.
    pub fn hash_reader<R: Read>(&self, mut reader: R) -> Result<String> {
        let mut hasher = Hasher::new(*self);
        let mut buffer = vec![0; BUFFER_CAPACITY];
        loop {
            let bytes = reader.read(&mut buffer).or_raise(|| ErrorKind::Io)?;
            if bytes == 0 {
                break;
            }
            hasher.update(&buffer[..bytes]);
        }
        Ok(hasher.finalize())
    }

    /// Hash a file on the local filesystem, reading it exactly once.
    ///
    /// This is blocking; wrap it in `spawn_blocking` from async code.
    pub fn hash_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let file = File::open(path).or_raise(|| ErrorKind::Io)?;
        let digest = self.hash_reader(BufReader::new(file))?;
        tracing::trace!(path = %path.display(), algorithm = %self, "Hashed local file");
        Ok(digest)
    }
}

/// Parse one line of `md5sum`/`b3sum` output into `(digest, path)`.
///
/// Accepts both text-mode (`<digest>  <path>`) and binary-mode
/// (`<digest> *<path>`) lines. Anything else (error messages, escaped names
/// starting with a backslash, non-hex digests) yields `None`; the caller treats
/// those paths as not yet determinable.
#[must_use]
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.starts_with('\\') {
        return None;
    }
    let (digest, rest) = line.split_once(' ')?;
    if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let path = rest.strip_prefix(' ').or_else(|| rest.strip_prefix('*'))?;
    if path.is_empty() {
        return None;
    }
    Some((digest, path))
}
