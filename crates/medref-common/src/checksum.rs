//! Streaming SHA-256 digests for file fingerprinting
//!
//! Source dumps reach several GB, so input is hashed in fixed-size chunks and
//! memory stays constant regardless of file size.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Size of the read buffer used while hashing.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of a file together with the number of bytes hashed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub hex: String,
    pub size_bytes: u64,
}

/// Hash a file and count its bytes in a single pass
pub fn compute_file_digest(path: impl AsRef<Path>) -> Result<FileDigest> {
    let mut file = std::fs::File::open(path)?;
    compute_digest(&mut file)
}

/// Hash any readable source
pub fn compute_digest<R: Read>(reader: &mut R) -> Result<FileDigest> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(FileDigest {
        hex: hex::encode(hasher.finalize()),
        size_bytes,
    })
}
