//! Content hashing.
//!
//! Repository blobs are addressed by the lowercase hex SHA-1 of their
//! contents. Hashing streams through a fixed buffer so large files never
//! land in memory whole.

use std::path::Path;

use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use crate::error::{UpdateError, UpdateResult};

/// Buffer size for file hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Hex SHA-1 of a byte slice.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-1 of a file's contents.
pub async fn sha1_of_file(path: &Path) -> UpdateResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UpdateError::io(path, e))?;

    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| UpdateError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
