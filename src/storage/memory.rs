//! In-memory object store
//!
//! DashMap-backed store with operation counters, fault and latency injection, used as
//! a stand-in for remote nodes in tests and for a disabled-persistence L3.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;

use super::{validate_object_key, ObjectInfo, ObjectStore, StoredObject};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct MemObject {
    data: Bytes,
    content_type: Option<String>,
    stored_at: chrono::DateTime<Utc>,
}

/// Operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryStats {
    pub object_count: u64,
    pub total_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// In-memory backend (bucket -> key -> object)
pub struct InMemoryObjectStore {
    name: String,
    storage: DashMap<String, DashMap<String, MemObject>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_probes: AtomicBool,
    write_delay_ms: AtomicU64,
    probe_delay_ms: AtomicU64,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::named("memory")
    }
}

impl InMemoryObjectStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a name used in error messages
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: DashMap::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_probes: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
            probe_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent read fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent probe fail
    pub fn set_fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::Relaxed);
    }

    /// Hold every subsequent write for `delay` before it lands
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Hold every subsequent probe for `delay` before it answers
    pub fn set_probe_delay(&self, delay: Duration) {
        self.probe_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Flip the first byte of a stored object. Returns false if absent.
    pub fn corrupt(&self, bucket: &str, key: &str) -> bool {
        let Some(bucket_data) = self.storage.get(bucket) else {
            return false;
        };
        let Some(mut obj) = bucket_data.get_mut(key) else {
            return false;
        };
        let mut data = obj.data.to_vec();
        match data.first_mut() {
            Some(b) => *b ^= 0xFF,
            None => data.push(0xFF),
        }
        obj.data = Bytes::from(data);
        true
    }

    /// Counters and sizes
    pub fn stats(&self) -> InMemoryStats {
        let mut object_count = 0;
        let mut total_bytes = 0;
        for bucket in self.storage.iter() {
            for obj in bucket.value().iter() {
                object_count += 1;
                total_bytes += obj.data.len() as u64;
            }
        }
        InMemoryStats {
            object_count,
            total_bytes,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    async fn delayed(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn injected(&self, flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::Relaxed) {
            return Err(Error::object_store(&self.name, format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        validate_object_key(key)?;
        Self::delayed(&self.write_delay_ms).await;
        self.injected(&self.fail_writes, "write")?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let bucket_data = self
            .storage
            .entry(bucket.to_string())
            .or_insert_with(DashMap::new);
        bucket_data.insert(
            key.to_string(),
            MemObject {
                data,
                content_type: content_type.map(str::to_string),
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        self.injected(&self.fail_reads, "read")?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(self.storage.get(bucket).and_then(|b| {
            b.get(key).map(|obj| StoredObject {
                data: obj.data.clone(),
                content_type: obj.content_type.clone(),
            })
        }))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool> {
        self.injected(&self.fail_writes, "delete")?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .storage
            .get(bucket)
            .map(|b| b.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        self.injected(&self.fail_reads, "head")?;
        Ok(self.storage.get(bucket).and_then(|b| {
            b.get(key).map(|obj| ObjectInfo {
                key: key.to_string(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.stored_at),
            })
        }))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.injected(&self.fail_reads, "list")?;
        let mut objects: Vec<ObjectInfo> = self
            .storage
            .get(bucket)
            .map(|b| {
                b.iter()
                    .filter(|e| e.key().starts_with(prefix))
                    .map(|e| ObjectInfo {
                        key: e.key().clone(),
                        size: e.value().data.len() as u64,
                        last_modified: Some(e.value().stored_at),
                    })
                    .collect()
            })
            .unwrap_or_default();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn probe(&self, _bucket: &str) -> Result<()> {
        Self::delayed(&self.probe_delay_ms).await;
        self.injected(&self.fail_probes, "probe")
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("b", "k", Bytes::from_static(b"data"), Some("text/plain"))
            .await
            .unwrap();

        let obj = store.get_object("b", "k").await.unwrap().unwrap();
        assert_eq!(obj.data, Bytes::from_static(b"data"));
        assert_eq!(obj.content_type.as_deref(), Some("text/plain"));

        assert!(store.delete_object("b", "k").await.unwrap());
        assert!(store.get_object("b", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("b", "k1", Bytes::from_static(b"data1"), None)
            .await
            .unwrap();
        store
            .put_object("b", "k2", Bytes::from_static(b"data2"), None)
            .await
            .unwrap();
        store.get_object("b", "k1").await.unwrap();
        store.delete_object("b", "k2").await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.object_count, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.deletes, 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = InMemoryObjectStore::named("flaky");
        store.set_fail_writes(true);
        let err = store
            .put_object("b", "k", Bytes::from_static(b"x"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("flaky"));

        store.set_fail_writes(false);
        store
            .put_object("b", "k", Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        store.set_fail_reads(true);
        assert!(store.get_object("b", "k").await.is_err());

        store.set_fail_probes(true);
        assert!(store.probe("b").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_flips_first_byte() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("b", "k", Bytes::from_static(&[0x00, 0x01]), None)
            .await
            .unwrap();
        assert!(store.corrupt("b", "k"));
        let obj = store.get_object("b", "k").await.unwrap().unwrap();
        assert_eq!(obj.data.as_ref(), &[0xFF, 0x01]);
        assert!(!store.corrupt("b", "missing"));
    }

    #[tokio::test]
    async fn test_write_delay_holds_the_write() {
        let store = InMemoryObjectStore::new();
        store.set_write_delay(Duration::from_millis(50));

        let start = std::time::Instant::now();
        store
            .put_object("b", "k", Bytes::from_static(b"x"), None)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(store.stats().writes, 1);
    }
}
