//! L3 Cache - Cold Object Store Tier
//!
//! Thin adapter from cache keys to objects in a single bucket of any
//! [`ObjectStore`]. Keys are stored verbatim under an optional prefix.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::artifact::{CacheTier, CachedArtifact};
use super::l2::DEFAULT_CONTENT_TYPE;
use crate::checksum::sha256_hex_offload;
use crate::error::Result;
use crate::storage::{ObjectInfo, ObjectStore};

/// Cold tier over an object store bucket
pub struct ColdStore {
    backend: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ColdStore {
    /// Create a cold store writing to `bucket` under `prefix`
    pub fn new(
        backend: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn set(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let size = data.len();
        self.backend
            .put_object(&self.bucket, &self.object_key(key), data, Some(content_type))
            .await?;
        debug!(key, size, bucket = %self.bucket, "L3 stored");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<CachedArtifact>> {
        let Some(obj) = self
            .backend
            .get_object(&self.bucket, &self.object_key(key))
            .await?
        else {
            return Ok(None);
        };
        let content_type = obj
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let checksum = sha256_hex_offload(&obj.data).await;
        Ok(Some(CachedArtifact::new(
            obj.data,
            content_type,
            Some(checksum),
            CacheTier::L3,
        )))
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self
            .backend
            .head_object(&self.bucket, &self.object_key(key))
            .await?
            .is_some())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend
            .delete_object(&self.bucket, &self.object_key(key))
            .await
    }

    /// All entries, with keys stripped of the prefix
    pub async fn entries(&self) -> Result<Vec<ObjectInfo>> {
        let objects = self.backend.list_objects(&self.bucket, &self.prefix).await?;
        Ok(objects
            .into_iter()
            .filter_map(|mut obj| {
                obj.key = obj.key.strip_prefix(&self.prefix)?.to_string();
                Some(obj)
            })
            .collect())
    }

    /// Delete every entry. Per-object failures are logged and skipped.
    pub async fn flush(&self) -> Result<usize> {
        let mut removed = 0;
        for obj in self.entries().await? {
            match self.delete(&obj.key).await {
                Ok(_) => removed += 1,
                Err(e) => warn!(key = %obj.key, error = %e, "failed to flush L3 entry"),
            }
        }
        Ok(removed)
    }

    pub fn describe(&self) -> String {
        format!("{}/{}", self.backend.describe(), self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    fn cold() -> (Arc<InMemoryObjectStore>, ColdStore) {
        let backend = Arc::new(InMemoryObjectStore::named("cold"));
        let store = ColdStore::new(backend.clone(), "depot-cache", "cache/");
        (backend, store)
    }

    #[tokio::test]
    async fn test_set_get_under_prefix() {
        let (backend, store) = cold();
        store
            .set("docker:library/nginx/blobs/sha256:abc", Bytes::from_static(b"layer"), "application/octet-stream")
            .await
            .unwrap();

        assert!(backend
            .get_object("depot-cache", "cache/docker:library/nginx/blobs/sha256:abc")
            .await
            .unwrap()
            .is_some());

        let artifact = store
            .get("docker:library/nginx/blobs/sha256:abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.data.as_ref(), b"layer");
        assert_eq!(artifact.source, CacheTier::L3);
        assert!(store.contains("docker:library/nginx/blobs/sha256:abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_strip_prefix_and_flush() {
        let (_backend, store) = cold();
        for key in ["npm:a", "npm:b"] {
            store
                .set(key, Bytes::from_static(b"x"), "text/plain")
                .await
                .unwrap();
        }

        let keys: Vec<String> = store.entries().await.unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["npm:a", "npm:b"]);

        assert_eq!(store.flush().await.unwrap(), 2);
        assert!(store.get("npm:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backend_errors_propagate() {
        let (backend, store) = cold();
        backend.set_fail_writes(true);
        assert!(store
            .set("npm:a", Bytes::from_static(b"x"), "text/plain")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_large_object_checksum() {
        let (_backend, store) = cold();
        let data = Bytes::from(vec![9u8; crate::checksum::BLOCKING_HASH_THRESHOLD + 17]);
        store
            .set("generic:disk.img", data.clone(), "application/octet-stream")
            .await
            .unwrap();

        let artifact = store.get("generic:disk.img").await.unwrap().unwrap();
        assert_eq!(artifact.checksum, crate::checksum::sha256_hex(&data));
        assert_eq!(artifact.size, data.len() as u64);
    }
}
