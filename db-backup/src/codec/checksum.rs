//! SHA-256 content hashing of finished artifacts.

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Hash and byte count of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// 64-character lowercase hex SHA-256
    pub hash: String,
    pub size: u64,
}

/// Hash the complete contents of `path`, reading `chunk_size` bytes at a
/// time so memory use does not depend on the artifact size.
pub async fn compute_file_digest(path: &Path, chunk_size: usize) -> io::Result<FileDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut size = 0u64;

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(FileDigest {
        hash: hex::encode(hasher.finalize()),
        size,
    })
}

/// `true` when `hash` looks like a SHA-256 hex digest.
pub fn is_sha256_hex(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}
