use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::VfsError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 over everything `reader` yields.
pub fn checksum_reader(reader: &mut dyn Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, VfsError> {
    let mut file = std::fs::File::open(path)?;
    Ok(checksum_reader(&mut file)?)
}

/// Computes the content hash used for integrity checks on completion and
/// for the optional hash in download tokens.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, reader: &mut dyn Read) -> io::Result<String>;

    /// Compares a client-supplied hash with a computed one.
    fn matches(&self, expected: &str, actual: &str) -> bool {
        expected.trim().eq_ignore_ascii_case(actual)
    }
}

/// Lower-case hex SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, reader: &mut dyn Read) -> io::Result<String> {
        checksum_reader(reader)
    }
}
