//! Object Storage Port
//!
//! Every place bytes land durably (replica nodes, the L3 cold tier) goes
//! through the [`ObjectStore`] trait.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        ObjectStore                             │
//! ├──────────────────┬──────────────────────┬─────────────────────┤
//! │ LocalObjectStore │ S3ObjectStore        │ InMemoryObjectStore │
//! │ temp+fsync+rename│ SigV4, path-style    │ tests, fault inject │
//! └──────────────────┴──────────────────────┴─────────────────────┘
//! ```

mod local;
mod memory;
mod s3;
mod sigv4;

pub use local::LocalObjectStore;
pub(crate) use local::write_atomic;
pub use memory::{InMemoryObjectStore, InMemoryStats};
pub use s3::{S3ObjectStore, S3Settings};
pub use sigv4::SigV4Signer;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// An object read back from a store
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// Listing / head metadata for an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend for replica nodes and the cold tier
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object, replacing any previous version
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<()>;

    /// Read an object; `None` when it does not exist
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>>;

    /// Delete an object; returns whether something was removed (S3 backends
    /// cannot tell and always report `true` on success)
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Object metadata without the body
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>>;

    /// List objects under a key prefix
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Lightweight reachability/writability check
    async fn probe(&self, bucket: &str) -> Result<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Reject keys that could escape a bucket directory or are empty
pub(crate) fn validate_object_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidRequest("object key is empty".to_string()));
    }
    if key.starts_with('/') || key.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(Error::InvalidRequest(format!(
            "object key '{}' is not a relative path",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_object_key() {
        assert!(validate_object_key("npm/lodash/-/lodash-4.17.21.tgz").is_ok());
        assert!(validate_object_key("").is_err());
        assert!(validate_object_key("/etc/passwd").is_err());
        assert!(validate_object_key("a/../../b").is_err());
        assert!(validate_object_key("a/./b").is_err());
    }
}
