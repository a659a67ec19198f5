//! Local filesystem object store
//!
//! Objects live at `root/<bucket>/<key>`. Content types and in-progress
//! writes live under `root/.depot/`, which no bucket can name, so no object
//! key can reach them and listings need no filtering.
//!
//! ```text
//! <root>/
//!   artifacts/npm/lodash-4.17.21.tgz
//!   .depot/meta/artifacts/npm/lodash-4.17.21.tgz   (content type)
//!   .depot/tmp/.tmp-<uuid>                         (write in progress)
//! ```
//!
//! Writes go to a temp file, are fsynced, then renamed into place so readers
//! never observe a partial object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{validate_object_key, ObjectInfo, ObjectStore, StoredObject};
use crate::error::{Error, Result};

/// Directory under the root reserved for store bookkeeping
const INTERNAL_DIR: &str = ".depot";

/// Prefix of in-progress temp files
const TEMP_PREFIX: &str = ".tmp-";

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Create a store rooted at `root` (created lazily on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_bucket(bucket: &str) -> Result<()> {
        if bucket.is_empty() || bucket.contains('/') || bucket.starts_with('.') {
            return Err(Error::InvalidRequest(format!("invalid bucket '{}'", bucket)));
        }
        Ok(())
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_object_key(key)?;
        Self::check_bucket(bucket)?;
        Ok(self.root.join(bucket).join(key))
    }

    fn content_type_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(INTERNAL_DIR).join("meta").join(bucket).join(key)
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join(INTERNAL_DIR).join("tmp")
    }
}

/// Write `data` to `path` atomically: temp file next to it, fsync, rename.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;
    write_atomic_via(parent, path, data).await
}

/// [`write_atomic`] staging the temp file in `tmp_dir`, which must be on the
/// same filesystem as `path`.
async fn write_atomic_via(tmp_dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent).await?;
    if tmp_dir != parent {
        fs::create_dir_all(tmp_dir).await?;
    }

    let tmp = tmp_dir.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
    let write = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    };

    if let Err(e) = write.await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn modified_at(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        let tmp_dir = self.temp_dir();
        write_atomic_via(&tmp_dir, &path, &data).await?;

        let sidecar = self.content_type_path(bucket, key);
        match content_type {
            Some(ct) => write_atomic_via(&tmp_dir, &sidecar, ct.as_bytes()).await?,
            None => {
                let _ = fs::remove_file(&sidecar).await;
            }
        }
        debug!(path = %path.display(), size = data.len(), "stored object");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        let path = self.object_path(bucket, key)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content_type = fs::read_to_string(self.content_type_path(bucket, key))
            .await
            .ok();
        Ok(Some(StoredObject {
            data: Bytes::from(data),
            content_type,
        }))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.object_path(bucket, key)?;
        let existed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let _ = fs::remove_file(self.content_type_path(bucket, key)).await;
        Ok(existed)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        let path = self.object_path(bucket, key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: meta.len(),
                last_modified: modified_at(&meta),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Self::check_bucket(bucket)?;
        let base = self.root.join(bucket);
        let mut objects = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    objects.push(ObjectInfo {
                        key,
                        size: meta.len(),
                        last_modified: modified_at(&meta),
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn probe(&self, _bucket: &str) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(Error::object_store(
                self.describe(),
                "root is not a directory",
            ));
        }

        let probe = self
            .root
            .join(format!("{}probe-{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        fs::write(&probe, b"probe").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip_with_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put_object(
                "artifacts",
                "npm/lodash-4.17.21.tgz",
                Bytes::from_static(b"tarball"),
                Some("application/gzip"),
            )
            .await
            .unwrap();

        let obj = store
            .get_object("artifacts", "npm/lodash-4.17.21.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obj.data.as_ref(), b"tarball");
        assert_eq!(obj.content_type.as_deref(), Some("application/gzip"));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        assert!(store.get_object("b", "missing").await.unwrap().is_none());
        assert!(store.head_object("b", "missing").await.unwrap().is_none());
        assert!(!store.delete_object("b", "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        for payload in [&b"first"[..], &b"second-version"[..]] {
            store
                .put_object("b", "k", Bytes::copy_from_slice(payload), None)
                .await
                .unwrap();
        }

        let listed = store.list_objects("b", "").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "k");
        assert_eq!(listed[0].size, 14);
        assert_eq!(std::fs::read_dir(store.temp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        for key in ["maven/a.jar", "maven/b.pom", "npm/c.tgz"] {
            store
                .put_object("b", key, Bytes::from_static(b"x"), Some("text/plain"))
                .await
                .unwrap();
        }

        let keys: Vec<String> = store
            .list_objects("b", "maven/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["maven/a.jar", "maven/b.pom"]);
    }

    #[tokio::test]
    async fn test_metadata_never_shadows_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put_object("b", "a.tgz.content-type", Bytes::from_static(b"REAL BYTES"), None)
            .await
            .unwrap();
        store
            .put_object("b", "a.tgz", Bytes::from_static(b"tarball"), Some("application/gzip"))
            .await
            .unwrap();
        store
            .put_object("b", ".tmp-upload", Bytes::from_static(b"dotfile"), None)
            .await
            .unwrap();

        let shadow = store.get_object("b", "a.tgz.content-type").await.unwrap().unwrap();
        assert_eq!(shadow.data.as_ref(), b"REAL BYTES");
        assert!(shadow.content_type.is_none());
        let obj = store.get_object("b", "a.tgz").await.unwrap().unwrap();
        assert_eq!(obj.content_type.as_deref(), Some("application/gzip"));

        let keys: Vec<String> = store
            .list_objects("b", "")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec![".tmp-upload", "a.tgz", "a.tgz.content-type"]);

        assert!(store.delete_object("b", "a.tgz").await.unwrap());
        assert!(store.get_object("b", "a.tgz.content-type").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_internal_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store
            .put_object(".depot", "meta/x", Bytes::from_static(b"x"), None)
            .await
            .is_err());
        assert!(store.list_objects(".depot", "").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .put_object("b", "../escape", Bytes::from_static(b"x"), None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_probe_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("node-1");
        let store = LocalObjectStore::new(&root);

        store.probe("any").await.unwrap();
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_probe_fails_when_root_is_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"file").unwrap();

        let store = LocalObjectStore::new(&root);
        assert!(store.probe("any").await.is_err());
    }
}
