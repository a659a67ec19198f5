//! L2 Cache - Local Disk Tier
//!
//! One file per key, sharded into subdirectories by the first two characters
//! of the file name. A `%meta` sidecar holds the key, content type and TTL as
//! JSON. Encoded names never contain `%m` or `%h`, so sidecars and hashed
//! names cannot collide with a data file for any key.
//!
//! ```text
//! <cache_dir>/
//!   np/
//!     npm%3Alodash%2F-%2Flodash-4.17.21.tgz
//!     npm%3Alodash%2F-%2Flodash-4.17.21.tgz%meta
//!   3f/
//!     %h3f9c...e1          (encoded name too long, named by key digest)
//!     %h3f9c...e1%meta
//! ```
//!
//! Writes are atomic (temp file, fsync, rename). Checksums are recomputed
//! from the stored bytes on read; `cached_at` is the file modification time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::artifact::{CacheTier, CachedArtifact};
use crate::checksum::{sha256_hex, sha256_hex_offload};
use crate::error::Result;
use crate::storage::write_atomic;

/// Suffix of the metadata sidecar
const META_SUFFIX: &str = "%meta";

/// Prefix of file names derived from the key digest
const HASHED_PREFIX: &str = "%h";

/// Longest encoded key used verbatim as a file name
const MAX_ENCODED_NAME: usize = 200;

/// Prefix of in-progress temp files (shared with the local object store)
const TEMP_PREFIX: &str = ".tmp-";

/// Content type reported when the sidecar is missing
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// L2 configuration
#[derive(Debug, Clone)]
pub struct L2Config {
    /// Cache directory
    pub cache_dir: PathBuf,
    /// Entries older than this are treated as misses and removed
    pub max_age: Option<Duration>,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./data/cache"),
            max_age: None,
        }
    }
}

/// Metadata for an L2 entry, without its bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    /// Decoded cache key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
}

/// Disk-backed warm tier
pub struct DiskStore {
    config: L2Config,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DiskStore {
    /// Create a store rooted at `config.cache_dir` (created lazily)
    pub fn new(config: L2Config) -> Self {
        Self {
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Path of the data file for a key
    pub fn file_path(&self, key: &str) -> PathBuf {
        let name = file_name(key);
        let shard: String = name
            .strip_prefix(HASHED_PREFIX)
            .unwrap_or(&name)
            .chars()
            .take(2)
            .collect();
        self.config.cache_dir.join(shard).join(name)
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    /// Store bytes under `key` along with its content type and TTL
    pub async fn set(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let path = self.file_path(key);
        let meta = serde_json::to_vec(&EntryMeta {
            key: key.to_string(),
            content_type: content_type.to_string(),
            ttl_ms: ttl.map(|ttl| ttl.as_millis() as u64),
        })?;
        // Sidecar first so every data file entries() sees can be named
        write_atomic(&Self::meta_path(&path), &meta).await?;
        write_atomic(&path, data).await?;
        debug!(key, size = data.len(), path = %path.display(), "L2 stored");
        Ok(())
    }

    /// Read an entry; expired entries are removed and reported as misses
    pub async fn get(&self, key: &str) -> Result<Option<CachedArtifact>> {
        let Some(entry) = self.stat(key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let path = self.file_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let meta = read_meta(&path).await;
        self.hits.fetch_add(1, Ordering::Relaxed);

        let checksum = sha256_hex_offload(&data).await;
        let mut artifact = CachedArtifact::new(
            data,
            content_type_of(meta.as_ref()),
            Some(checksum),
            CacheTier::L2,
        );
        artifact.cached_at = entry.modified;
        artifact.ttl = meta.and_then(|m| m.ttl_ms).map(Duration::from_millis);
        Ok(Some(artifact))
    }

    /// Open an entry for streaming; returns the file handle and its metadata
    pub async fn open(&self, key: &str) -> Result<Option<(fs::File, DiskEntry, String)>> {
        let Some(entry) = self.stat(key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let path = self.file_path(key);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let content_type = content_type_of(read_meta(&path).await.as_ref());
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some((file, entry, content_type)))
    }

    /// Metadata for a key; expired entries are removed
    pub async fn stat(&self, key: &str) -> Result<Option<DiskEntry>> {
        let path = self.file_path(key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        if self.is_expired(modified) {
            debug!(key, "L2 entry past max age");
            self.delete(key).await?;
            return Ok(None);
        }

        Ok(Some(DiskEntry {
            key: key.to_string(),
            size: meta.len(),
            modified,
        }))
    }

    fn is_expired(&self, modified: DateTime<Utc>) -> bool {
        let Some(max_age) = self.config.max_age else {
            return false;
        };
        let age = Utc::now().signed_duration_since(modified);
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }

    /// Remove an entry; returns whether the data file existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.file_path(key);
        let existed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let _ = fs::remove_file(Self::meta_path(&path)).await;
        Ok(existed)
    }

    /// Enumerate all entries across shard directories
    pub async fn entries(&self) -> Result<Vec<DiskEntry>> {
        let mut entries = Vec::new();
        let mut shards = match fs::read_dir(&self.config.cache_dir).await {
            Ok(shards) => shards,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) || name.ends_with(META_SUFFIX) {
                    continue;
                }
                let meta = file.metadata().await?;
                if !meta.is_file() {
                    continue;
                }
                let key = if name.starts_with(HASHED_PREFIX) {
                    read_meta(&file.path()).await.map(|m| m.key)
                } else {
                    decode_key(&name)
                };
                let Some(key) = key else {
                    warn!(file = %name, "skipping L2 file with unresolvable key");
                    continue;
                };
                entries.push(DiskEntry {
                    key,
                    size: meta.len(),
                    modified: meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Delete every entry. Per-file failures are logged and skipped.
    pub async fn flush(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries().await? {
            match self.delete(&entry.key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %entry.key, error = %e, "failed to flush L2 entry"),
            }
        }
        Ok(removed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// File name for a key: the encoded key, or its digest when that is too long
fn file_name(key: &str) -> String {
    let encoded = encode_key(key);
    if encoded.len() <= MAX_ENCODED_NAME {
        encoded
    } else {
        format!("{}{}", HASHED_PREFIX, sha256_hex(key.as_bytes()))
    }
}

async fn read_meta(path: &Path) -> Option<EntryMeta> {
    let raw = fs::read(DiskStore::meta_path(path)).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable L2 sidecar");
            None
        }
    }
}

fn content_type_of(meta: Option<&EntryMeta>) -> String {
    meta.map(|m| m.content_type.trim())
        .filter(|ct| !ct.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Escape a key into a single filesystem-safe path component
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    // Never produce "." or ".." or a temp-looking name
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

/// Inverse of [`encode_key`]
pub fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// =============================================================================
// Tests
// =============================================================================
