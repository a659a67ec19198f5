//! L1 Cache - In-Memory KV Tier
//!
//! The hot tier speaks a minimal remote-KV contract ([`L1Store`]): set with
//! TTL, get, multi-delete, glob key listing and remaining-TTL lookup. Values
//! are opaque byte strings; artifacts are framed into them with
//! [`encode_record`] / [`decode_record`].
//!
//! [`MemoryL1Store`] is the in-process implementation: DashMap storage with
//! lazy expiry and watermark-based eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::artifact::{CacheTier, CachedArtifact};
use crate::error::{Error, Result};

/// Remote KV contract used by the L1 tier
#[async_trait]
pub trait L1Store: Send + Sync {
    /// Store a value. A zero TTL means no expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Keys matching a glob pattern (`*` and `?`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remaining TTL; `None` when the key is absent or has no expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

// =============================================================================
// Record framing
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    content_type: String,
    checksum: String,
    size: u64,
    cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
}

/// Frame an artifact as `u32 BE header length | JSON header | data`
pub fn encode_record(artifact: &CachedArtifact) -> Result<Bytes> {
    let header = serde_json::to_vec(&RecordHeader {
        content_type: artifact.content_type.clone(),
        checksum: artifact.checksum.clone(),
        size: artifact.size,
        cached_at: artifact.cached_at,
        ttl_ms: artifact.ttl.map(|ttl| ttl.as_millis() as u64),
    })?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| Error::Internal("L1 record header too large".to_string()))?;

    let mut buf = BytesMut::with_capacity(4 + header.len() + artifact.data.len());
    buf.put_u32(header_len);
    buf.put_slice(&header);
    buf.put_slice(&artifact.data);
    Ok(buf.freeze())
}

/// Decode a framed record back into an artifact sourced from L1
pub fn decode_record(raw: Bytes) -> Result<CachedArtifact> {
    if raw.len() < 4 {
        return Err(Error::Internal("L1 record truncated".to_string()));
    }
    let header_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let data_start = 4 + header_len;
    if raw.len() < data_start {
        return Err(Error::Internal("L1 record header truncated".to_string()));
    }

    let header: RecordHeader = serde_json::from_slice(&raw[4..data_start])?;
    let data = raw.slice(data_start..);
    if data.len() as u64 != header.size {
        return Err(Error::Internal(format!(
            "L1 record size mismatch: header {} bytes, body {} bytes",
            header.size,
            data.len()
        )));
    }

    Ok(CachedArtifact {
        data,
        size: header.size,
        content_type: header.content_type,
        checksum: header.checksum,
        cached_at: header.cached_at,
        source: CacheTier::L1,
        ttl: header.ttl_ms.map(Duration::from_millis),
    })
}

/// Glob match supporting `*` (any run) and `?` (any single char)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// In-memory L1 configuration
#[derive(Debug, Clone)]
pub struct L1Config {
    /// Maximum capacity in bytes
    pub capacity: u64,
    /// High watermark percentage (trigger eviction)
    pub high_watermark: f64,
    /// Low watermark percentage (stop eviction)
    pub low_watermark: f64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            capacity: 1024 * 1024 * 1024,
            high_watermark: 0.90,
            low_watermark: 0.80,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// DashMap-backed [`L1Store`]
pub struct MemoryL1Store {
    storage: DashMap<String, Slot>,
    config: L1Config,
    current_size: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryL1Store {
    fn default() -> Self {
        Self::with_config(L1Config::default())
    }
}

impl MemoryL1Store {
    /// Create a store with default capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        Self {
            storage: DashMap::new(),
            config,
            current_size: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Bytes currently held
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Number of live and not-yet-reaped entries
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Entries dropped to make room
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Drop a key immediately, as if the KV server evicted it
    pub fn evict(&self, key: &str) -> bool {
        self.remove_key(key)
    }

    fn remove_key(&self, key: &str) -> bool {
        match self.storage.remove(key) {
            Some((_, slot)) => {
                self.current_size
                    .fetch_sub(slot.value.len() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn ratio(&self) -> f64 {
        self.size() as f64 / self.config.capacity.max(1) as f64
    }

    /// Evict expired entries, then soonest-to-expire, down to the low watermark
    fn evict_to_low_watermark(&self, incoming: u64) {
        let projected = (self.size() + incoming) as f64 / self.config.capacity.max(1) as f64;
        if projected < self.config.high_watermark {
            return;
        }

        let now = Instant::now();
        let mut candidates: Vec<(String, Option<Instant>, bool)> = self
            .storage
            .iter()
            .map(|e| (e.key().clone(), e.value().expires_at, e.value().is_expired(now)))
            .collect();

        // Expired first, then by expiry (no expiry last)
        candidates.sort_by(|a, b| {
            b.2.cmp(&a.2).then_with(|| match (a.1, b.1) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
        });

        for (key, _, _) in candidates {
            if self.ratio() <= self.config.low_watermark
                && (self.size() + incoming) <= self.config.capacity
            {
                break;
            }
            if self.remove_key(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl L1Store for MemoryL1Store {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let size = value.len() as u64;
        if size > self.config.capacity {
            return Err(Error::InvalidRequest(format!(
                "value of {} bytes exceeds L1 capacity {}",
                size, self.config.capacity
            )));
        }

        let replacing = self
            .storage
            .get(key)
            .map(|slot| slot.value.len() as u64)
            .unwrap_or(0);
        self.evict_to_low_watermark(size.saturating_sub(replacing));

        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        // Counted before the slot is visible so a racing remove cannot underflow
        self.current_size.fetch_add(size, Ordering::Relaxed);
        if let Some(old) = self
            .storage
            .insert(key.to_string(), Slot { value, expires_at })
        {
            self.current_size
                .fetch_sub(old.value.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        let expired = match self.storage.get(key) {
            Some(slot) if !slot.is_expired(now) => return Ok(Some(slot.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            if let Some((_, slot)) = self.storage.remove_if(key, |_, slot| slot.is_expired(now)) {
                self.current_size
                    .fetch_sub(slot.value.len() as u64, Ordering::Relaxed);
            }
        }
        Ok(None)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        Ok(keys.iter().filter(|k| self.remove_key(k)).count() as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .storage
            .iter()
            .filter(|e| !e.value().is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self.storage.get(key).and_then(|slot| {
            if slot.is_expired(now) {
                None
            } else {
                slot.expires_at.map(|at| at.saturating_duration_since(now))
            }
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(data: &'static [u8]) -> CachedArtifact {
        CachedArtifact::new(Bytes::from_static(data), "application/gzip", None, CacheTier::L1)
    }

    #[test]
    fn test_record_roundtrip() {
        let original = artifact(b"tarball bytes");
        let decoded = decode_record(encode_record(&original).unwrap()).unwrap();

        assert_eq!(decoded.data, original.data);
        assert_eq!(decoded.checksum, original.checksum);
        assert_eq!(decoded.content_type, "application/gzip");
        assert_eq!(decoded.cached_at, original.cached_at);
        assert_eq!(decoded.source, CacheTier::L1);
        assert_eq!(decoded.ttl, None);

        let mut with_ttl = artifact(b"tarball bytes");
        with_ttl.ttl = Some(Duration::from_secs(90));
        let decoded = decode_record(encode_record(&with_ttl).unwrap()).unwrap();
        assert_eq!(decoded.ttl, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_record(Bytes::from_static(b"xy")).is_err());
        assert!(decode_record(Bytes::from_static(&[0, 0, 0, 50, b'{'])).is_err());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "npm:lodash"));
        assert!(glob_match("npm:*", "npm:lodash/-/lodash.tgz"));
        assert!(!glob_match("npm:*", "maven:x.jar"));
        assert!(glob_match("*.tgz", "npm:a.tgz"));
        assert!(glob_match("npm:?odash", "npm:lodash"));
        assert!(!glob_match("npm:?", "npm:ab"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("a*b*c", "a-x-c-y-b"));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryL1Store::new();
        store
            .set("npm:a", Bytes::from_static(b"data"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.size(), 4);
        assert_eq!(
            store.get("npm:a").await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );

        let deleted = store
            .delete(&["npm:a".to_string(), "npm:missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("npm:a").await.unwrap().is_none());
        assert_eq!(store.size(), 0);
    }

    #[tokio::test]
    async fn test_replace_updates_size() {
        let store = MemoryL1Store::new();
        store
            .set("k", Bytes::from_static(b"original"), Duration::ZERO)
            .await
            .unwrap();
        store
            .set("k", Bytes::from_static(b"replaced content"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.size(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_replace_keeps_size_exact() {
        let store = std::sync::Arc::new(MemoryL1Store::new());
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..2_000usize {
                        let value = Bytes::from(vec![b'x'; 1 + (w * 31 + i) % 200]);
                        store.set("npm:same", value, Duration::ZERO).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let stored = store.get("npm:same").await.unwrap().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.size(), stored.len() as u64);
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = MemoryL1Store::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.ttl("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.ttl("k").await.unwrap().is_none());
        assert!(store.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_zero_means_persistent() {
        let store = MemoryL1Store::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.ttl("k").await.unwrap().is_none());
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let store = MemoryL1Store::new();
        for key in ["npm:a", "npm:b", "maven:c"] {
            store
                .set(key, Bytes::from_static(b"x"), Duration::ZERO)
                .await
                .unwrap();
        }
        assert_eq!(store.keys("npm:*").await.unwrap(), vec!["npm:a", "npm:b"]);
        assert_eq!(store.keys("*").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_eviction_under_pressure() {
        let store = MemoryL1Store::with_config(L1Config {
            capacity: 1000,
            high_watermark: 0.80,
            low_watermark: 0.50,
        });

        for i in 0..20 {
            store
                .set(
                    &format!("k-{}", i),
                    Bytes::from(vec![i as u8; 100]),
                    Duration::from_secs(60 + i),
                )
                .await
                .unwrap();
        }

        assert!(store.size() <= 1000);
        assert!(store.evictions() > 0);
        // Latest write always survives
        assert!(store.get("k-19").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_oversized_value_rejected() {
        let store = MemoryL1Store::with_config(L1Config {
            capacity: 10,
            ..Default::default()
        });
        assert!(store
            .set("k", Bytes::from(vec![0u8; 11]), Duration::ZERO)
            .await
            .is_err());
    }
}
