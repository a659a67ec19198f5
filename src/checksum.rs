//! Content checksums
//!
//! A single SHA-256 hex digest is used for cache tagging, replication and
//! verification so write-time and verify-time hashes always agree.

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Bodies at least this large are hashed on the blocking pool
pub const BLOCKING_HASH_THRESHOLD: usize = 1024 * 1024;

/// Compute the lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// [`sha256_hex`] for async callers; large bodies are hashed off the runtime
/// worker threads.
pub async fn sha256_hex_offload(data: &Bytes) -> String {
    if data.len() < BLOCKING_HASH_THRESHOLD {
        return sha256_hex(data);
    }
    let owned = data.clone();
    match tokio::task::spawn_blocking(move || sha256_hex(&owned)).await {
        Ok(digest) => digest,
        Err(_) => sha256_hex(data),
    }
}
