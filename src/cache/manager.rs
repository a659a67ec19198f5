//! Cache Manager - Unified Three-Tier Cache
//!
//! Routes writes by artifact size, probes L1 → L2 → L3 on reads and copies
//! small warm/cold hits back up through the promotion pool.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::AsyncRead;
use tracing::{debug, instrument, warn};

use super::artifact::{CacheTier, CachedArtifact};
use super::key::CacheKey;
use super::l1::{decode_record, encode_record, L1Store, MemoryL1Store};
use super::l2::{DiskStore, L2Config};
use super::l3::ColdStore;
use super::listing::{paginate, CacheItem, CacheStats, ListPage, ListQuery, TierStats};
use super::{L1_THRESHOLD, L2_THRESHOLD};
use crate::error::{Error, Result};
use crate::tasks::{TaskPool, TaskPoolStats};
use crate::telemetry::{CACHE_LOOKUPS, CACHE_PROMOTIONS, CACHE_WRITES};

/// Number of keys deleted per L1 round trip when flushing
const FLUSH_BATCH: usize = 500;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Artifacts below this size go to L1 + L2
    pub l1_threshold: u64,
    /// Artifacts at or above this size go to L3 when enabled
    pub l2_threshold: u64,
    /// L2 configuration
    pub l2: L2Config,
    /// Concurrent promotion tasks
    pub promotion_workers: usize,
    /// Promotion backlog before new promotions are dropped
    pub promotion_queue: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_threshold: L1_THRESHOLD,
            l2_threshold: L2_THRESHOLD,
            l2: L2Config::default(),
            promotion_workers: 4,
            promotion_queue: 256,
        }
    }
}

/// Streaming view of a cached artifact
pub struct CacheReader {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub size: u64,
    pub content_type: String,
    /// Absent for L2 hits, which are streamed without hashing
    pub checksum: Option<String>,
    pub source: CacheTier,
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl CacheReader {
    fn from_artifact(artifact: CachedArtifact) -> Self {
        Self {
            size: artifact.size,
            content_type: artifact.content_type,
            checksum: Some(artifact.checksum),
            source: artifact.source,
            reader: Box::new(std::io::Cursor::new(artifact.data)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AccessRecord {
    hits: u64,
    last_accessed: DateTime<Utc>,
}

/// Unified cache manager
pub struct CacheManager {
    l1: Arc<dyn L1Store>,
    l2: Arc<DiskStore>,
    l3: Option<Arc<ColdStore>>,
    config: CacheConfig,
    promotions: TaskPool,
    access: DashMap<String, AccessRecord>,
}

impl CacheManager {
    /// Create a cache manager over the given tiers; `l3` of `None` disables
    /// the cold tier.
    pub fn new(config: CacheConfig, l1: Arc<dyn L1Store>, l3: Option<ColdStore>) -> Self {
        Self {
            l2: Arc::new(DiskStore::new(config.l2.clone())),
            l1,
            l3: l3.map(Arc::new),
            promotions: TaskPool::new(
                "cache-promotion",
                config.promotion_workers,
                config.promotion_queue,
            ),
            config,
            access: DashMap::new(),
        }
    }

    /// In-process L1, disk L2 under `cache_dir`, no L3
    pub fn with_memory_l1(cache_dir: impl Into<std::path::PathBuf>) -> Self {
        let config = CacheConfig {
            l2: L2Config {
                cache_dir: cache_dir.into(),
                max_age: None,
            },
            ..Default::default()
        };
        Self::new(config, Arc::new(MemoryL1Store::new()), None)
    }

    /// Configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether the cold tier is enabled
    pub fn l3_enabled(&self) -> bool {
        self.l3.is_some()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store an artifact, routing by size.
    ///
    /// Small artifacts go to L1 and L2 concurrently and succeed if either
    /// tier accepted them. Medium artifacts go to L2 only. Large artifacts go
    /// to L3, or to L2 when L3 is disabled. `ttl` defaults to the policy for
    /// the key's artifact type.
    #[instrument(skip(self, data, checksum), fields(key = %key, size = data.len()))]
    pub async fn set(
        &self,
        key: &CacheKey,
        data: Bytes,
        content_type: &str,
        checksum: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key_str = key.to_string();
        let ttl = ttl.unwrap_or_else(|| key.default_ttl());
        let size = data.len() as u64;

        if size < self.config.l1_threshold {
            let mut artifact = CachedArtifact::new(
                data,
                content_type,
                checksum.map(str::to_string),
                CacheTier::L1,
            );
            artifact.ttl = Some(ttl);
            let (l1, l2) = tokio::join!(
                self.write_l1(&key_str, &artifact, ttl),
                self.l2
                    .set(&key_str, &artifact.data, &artifact.content_type, Some(ttl))
            );
            record_write(CacheTier::L1, &l1);
            record_write(CacheTier::L2, &l2);

            match (l1, l2) {
                (Err(e1), Err(e2)) => {
                    warn!(l1_error = %e1, l2_error = %e2, "artifact not cached in any tier");
                    Err(e2)
                }
                (Err(e), Ok(())) => {
                    warn!(error = %e, "L1 write failed, artifact cached in L2 only");
                    Ok(())
                }
                (Ok(()), Err(e)) => {
                    warn!(error = %e, "L2 write failed, artifact cached in L1 only");
                    Ok(())
                }
                (Ok(()), Ok(())) => Ok(()),
            }
        } else if size < self.config.l2_threshold {
            let result = self.l2.set(&key_str, &data, content_type, Some(ttl)).await;
            record_write(CacheTier::L2, &result);
            result
        } else if let Some(l3) = &self.l3 {
            let result = l3.set(&key_str, data, content_type).await;
            record_write(CacheTier::L3, &result);
            result
        } else {
            debug!("L3 disabled, storing large artifact in L2");
            let result = self.l2.set(&key_str, &data, content_type, Some(ttl)).await;
            record_write(CacheTier::L2, &result);
            result
        }
    }

    async fn write_l1(&self, key: &str, artifact: &CachedArtifact, ttl: Duration) -> Result<()> {
        let record = encode_record(artifact)?;
        self.l1.set(key, record, ttl).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up an artifact, probing L1 → L2 → L3.
    ///
    /// Tier errors are logged and treated as misses. Small L2/L3 hits are
    /// queued for promotion; the lookup never waits on it.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &CacheKey) -> Option<CachedArtifact> {
        let key_str = key.to_string();

        if let Some(artifact) = self.lookup_l1(&key_str).await {
            self.record_access(&key_str);
            return Some(artifact);
        }

        match self.l2.get(&key_str).await {
            Ok(Some(artifact)) => {
                record_lookup(CacheTier::L2, "hit");
                self.record_access(&key_str);
                if artifact.size < self.config.l1_threshold {
                    self.promote(key, &artifact, &[CacheTier::L1]);
                }
                return Some(artifact);
            }
            Ok(None) => record_lookup(CacheTier::L2, "miss"),
            Err(e) => {
                record_lookup(CacheTier::L2, "error");
                warn!(error = %e, "L2 lookup failed");
            }
        }

        let artifact = self.lookup_l3(&key_str).await?;
        self.record_access(&key_str);
        if artifact.size < self.config.l1_threshold {
            self.promote(key, &artifact, &[CacheTier::L1, CacheTier::L2]);
        }
        Some(artifact)
    }

    async fn lookup_l1(&self, key: &str) -> Option<CachedArtifact> {
        let raw = match self.l1.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                record_lookup(CacheTier::L1, "miss");
                return None;
            }
            Err(e) => {
                record_lookup(CacheTier::L1, "error");
                warn!(key, error = %e, "L1 lookup failed");
                return None;
            }
        };
        match decode_record(raw) {
            Ok(artifact) => {
                record_lookup(CacheTier::L1, "hit");
                Some(artifact)
            }
            Err(e) => {
                record_lookup(CacheTier::L1, "error");
                warn!(key, error = %e, "dropping undecodable L1 record");
                let _ = self.l1.delete(&[key.to_string()]).await;
                None
            }
        }
    }

    async fn lookup_l3(&self, key: &str) -> Option<CachedArtifact> {
        let l3 = self.l3.as_ref()?;
        match l3.get(key).await {
            Ok(Some(artifact)) => {
                record_lookup(CacheTier::L3, "hit");
                Some(artifact)
            }
            Ok(None) => {
                record_lookup(CacheTier::L3, "miss");
                None
            }
            Err(e) => {
                record_lookup(CacheTier::L3, "error");
                warn!(key, error = %e, "L3 lookup failed");
                None
            }
        }
    }

    /// Open an artifact for streaming. L2 hits stream straight from disk.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_reader(&self, key: &CacheKey) -> Option<CacheReader> {
        let key_str = key.to_string();

        if let Some(artifact) = self.lookup_l1(&key_str).await {
            self.record_access(&key_str);
            return Some(CacheReader::from_artifact(artifact));
        }

        match self.l2.open(&key_str).await {
            Ok(Some((file, entry, content_type))) => {
                record_lookup(CacheTier::L2, "hit");
                self.record_access(&key_str);
                if entry.size < self.config.l1_threshold {
                    self.promote_from_l2(key);
                }
                return Some(CacheReader {
                    reader: Box::new(file),
                    size: entry.size,
                    content_type,
                    checksum: None,
                    source: CacheTier::L2,
                });
            }
            Ok(None) => record_lookup(CacheTier::L2, "miss"),
            Err(e) => {
                record_lookup(CacheTier::L2, "error");
                warn!(error = %e, "L2 open failed");
            }
        }

        let artifact = self.lookup_l3(&key_str).await?;
        self.record_access(&key_str);
        if artifact.size < self.config.l1_threshold {
            self.promote(key, &artifact, &[CacheTier::L1, CacheTier::L2]);
        }
        Some(CacheReader::from_artifact(artifact))
    }

    /// Tiers currently holding `key`, fastest first
    pub async fn locate(&self, key: &CacheKey) -> Vec<CacheTier> {
        let key_str = key.to_string();
        let mut tiers = Vec::new();

        if matches!(self.l1.get(&key_str).await, Ok(Some(_))) {
            tiers.push(CacheTier::L1);
        }
        if matches!(self.l2.stat(&key_str).await, Ok(Some(_))) {
            tiers.push(CacheTier::L2);
        }
        if let Some(l3) = &self.l3 {
            if matches!(l3.contains(&key_str).await, Ok(true)) {
                tiers.push(CacheTier::L3);
            }
        }
        tiers
    }

    /// Whether any tier holds `key`
    pub async fn contains(&self, key: &CacheKey) -> bool {
        !self.locate(key).await.is_empty()
    }

    // =========================================================================
    // Promotion
    // =========================================================================

    fn promote(&self, key: &CacheKey, artifact: &CachedArtifact, targets: &[CacheTier]) {
        let from = artifact.source;
        let key_str = key.to_string();
        let ttl = artifact.ttl.unwrap_or_else(|| key.default_ttl());
        let targets = targets.to_vec();
        let l1 = Arc::clone(&self.l1);
        let l2 = Arc::clone(&self.l2);
        let mut artifact = artifact.clone();
        artifact.cached_at = Utc::now();
        artifact.ttl = Some(ttl);

        let task = async move {
            for tier in targets {
                match tier {
                    CacheTier::L1 => l1.set(&key_str, encode_record(&artifact)?, ttl).await?,
                    CacheTier::L2 => {
                        l2.set(&key_str, &artifact.data, &artifact.content_type, Some(ttl))
                            .await?
                    }
                    CacheTier::L3 => {}
                }
            }
            debug!(key = %key_str, from = %from, "promoted");
            Ok::<(), Error>(())
        };
        self.submit_promotion(key, from, task);
    }

    fn promote_from_l2(&self, key: &CacheKey) {
        let key_str = key.to_string();
        let default_ttl = key.default_ttl();
        let l1 = Arc::clone(&self.l1);
        let l2 = Arc::clone(&self.l2);

        let task = async move {
            if let Some(mut artifact) = l2.get(&key_str).await? {
                let ttl = *artifact.ttl.get_or_insert(default_ttl);
                artifact.cached_at = Utc::now();
                l1.set(&key_str, encode_record(&artifact)?, ttl).await?;
                debug!(key = %key_str, from = "L2", "promoted");
            }
            Ok::<(), Error>(())
        };
        self.submit_promotion(key, CacheTier::L2, task);
    }

    fn submit_promotion<F>(&self, key: &CacheKey, from: CacheTier, task: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let label = format!("promote {}", key);
        let tracked = async move {
            let result = task.await;
            let outcome = if result.is_ok() { "ok" } else { "failed" };
            CACHE_PROMOTIONS
                .with_label_values(&[from.label(), outcome])
                .inc();
            result
        };
        if self.promotions.submit(label, tracked).is_err() {
            CACHE_PROMOTIONS
                .with_label_values(&[from.label(), "rejected"])
                .inc();
        }
    }

    /// Promotion pool counters
    pub fn promotion_stats(&self) -> TaskPoolStats {
        self.promotions.stats()
    }

    /// Wait for queued promotions to finish
    pub async fn drain_promotions(&self) {
        self.promotions.drain().await;
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove `key` from every tier. Returns whether any tier held it.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let key_str = key.to_string();
        self.access.remove(&key_str);
        let mut removed = false;

        match self.l1.delete(std::slice::from_ref(&key_str)).await {
            Ok(n) => removed |= n > 0,
            Err(e) => warn!(error = %e, "L1 invalidate failed"),
        }
        match self.l2.delete(&key_str).await {
            Ok(existed) => removed |= existed,
            Err(e) => warn!(error = %e, "L2 invalidate failed"),
        }
        if let Some(l3) = &self.l3 {
            match l3.delete(&key_str).await {
                Ok(existed) => removed |= existed,
                Err(e) => warn!(error = %e, "L3 invalidate failed"),
            }
        }
        removed
    }

    /// Delete every L1 entry
    pub async fn flush_l1(&self) -> Result<usize> {
        let keys = self.l1.keys("*").await?;
        let mut removed = 0;
        for batch in keys.chunks(FLUSH_BATCH) {
            match self.l1.delete(batch).await {
                Ok(n) => removed += n as usize,
                Err(e) => warn!(error = %e, batch = batch.len(), "failed to flush L1 batch"),
            }
        }
        debug!(removed, "flushed L1");
        Ok(removed)
    }

    /// Delete every L2 entry
    pub async fn flush_l2(&self) -> Result<usize> {
        let removed = self.l2.flush().await?;
        debug!(removed, "flushed L2");
        Ok(removed)
    }

    /// Delete every L3 entry; a no-op when L3 is disabled
    pub async fn flush_l3(&self) -> Result<usize> {
        let Some(l3) = &self.l3 else {
            return Ok(0);
        };
        let removed = l3.flush().await?;
        debug!(removed, "flushed L3");
        Ok(removed)
    }

    // =========================================================================
    // Listing & stats
    // =========================================================================

    /// Merge L1 and L2 entries, filter, then paginate
    pub async fn list_items(&self, query: &ListQuery) -> Result<ListPage> {
        let mut items: Vec<CacheItem> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for key in self.l1.keys("*").await? {
            let Ok(Some(raw)) = self.l1.get(&key).await else {
                continue;
            };
            let Ok(artifact) = decode_record(raw) else {
                continue;
            };
            let mut item = CacheItem::for_key(&key, CacheTier::L1, artifact.size);
            item.checksum = Some(artifact.checksum);
            item.cached_at = Some(artifact.cached_at);
            item.ttl_secs = self.l1.ttl(&key).await.ok().flatten().map(|d| d.as_secs());
            seen.insert(key);
            items.push(item);
        }

        for entry in self.l2.entries().await? {
            if seen.contains(&entry.key) {
                continue;
            }
            let mut item = CacheItem::for_key(&entry.key, CacheTier::L2, entry.size);
            item.cached_at = Some(entry.modified);
            items.push(item);
        }

        for item in &mut items {
            if let Some(record) = self.access.get(&item.key) {
                item.hit_count = record.hits;
                item.last_accessed = Some(record.last_accessed);
            }
        }

        Ok(paginate(items, query))
    }

    /// Per-tier item counts and sizes
    pub async fn get_cache_stats(&self) -> Result<CacheStats> {
        let mut l1 = TierStats::default();
        for key in self.l1.keys("*").await? {
            if let Ok(Some(raw)) = self.l1.get(&key).await {
                l1.items += 1;
                l1.bytes += decode_record(raw.clone())
                    .map(|a| a.size)
                    .unwrap_or(raw.len() as u64);
            }
        }

        let l2 = self
            .l2
            .entries()
            .await?
            .iter()
            .fold(TierStats::default(), |acc, e| TierStats {
                items: acc.items + 1,
                bytes: acc.bytes + e.size,
            });

        let l3 = match &self.l3 {
            Some(l3) => Some(l3.entries().await?.iter().fold(
                TierStats::default(),
                |acc, o| TierStats {
                    items: acc.items + 1,
                    bytes: acc.bytes + o.size,
                },
            )),
            None => None,
        };

        Ok(CacheStats::new(l1, l2, l3))
    }

    fn record_access(&self, key: &str) {
        let now = Utc::now();
        self.access
            .entry(key.to_string())
            .and_modify(|r| {
                r.hits += 1;
                r.last_accessed = now;
            })
            .or_insert(AccessRecord {
                hits: 1,
                last_accessed: now,
            });
    }
}

fn record_lookup(tier: CacheTier, result: &str) {
    CACHE_LOOKUPS
        .with_label_values(&[tier.label(), result])
        .inc();
}

fn record_write(tier: CacheTier, result: &Result<()>) {
    let outcome = if result.is_ok() { "ok" } else { "failed" };
    CACHE_WRITES.with_label_values(&[tier.label(), outcome]).inc();
}

// =============================================================================
// Tests
// =============================================================================
