//! Cached artifact values and the tier they were served from

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::sha256_hex;

/// Cache tier identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheTier {
    /// In-memory KV store
    L1,
    /// Local disk
    L2,
    /// Object store cold tier
    L3,
}

impl CacheTier {
    /// Lowercase label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => write!(f, "L1"),
            Self::L2 => write!(f, "L2"),
            Self::L3 => write!(f, "L3"),
        }
    }
}

/// An artifact held by the cache
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    /// Artifact bytes
    pub data: Bytes,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    pub content_type: String,
    /// SHA-256 hex of `data`
    pub checksum: String,
    /// When the artifact entered the cache
    pub cached_at: DateTime<Utc>,
    /// Tier the artifact was served from
    pub source: CacheTier,
    /// TTL the artifact was stored with, when the tier records it
    pub ttl: Option<Duration>,
}

impl CachedArtifact {
    /// Build an artifact, computing the checksum when none is given
    pub fn new(
        data: Bytes,
        content_type: impl Into<String>,
        checksum: Option<String>,
        source: CacheTier,
    ) -> Self {
        let checksum = checksum
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| sha256_hex(&data));
        Self {
            size: data.len() as u64,
            data,
            content_type: content_type.into(),
            checksum,
            cached_at: Utc::now(),
            source,
            ttl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_computed_when_missing() {
        let a = CachedArtifact::new(Bytes::from_static(b"abc"), "text/plain", None, CacheTier::L1);
        assert_eq!(
            a.checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(a.size, 3);

        let b = CachedArtifact::new(
            Bytes::from_static(b"abc"),
            "text/plain",
            Some(String::new()),
            CacheTier::L2,
        );
        assert_eq!(b.checksum, a.checksum);
    }

    #[test]
    fn test_tier_labels() {
        assert_eq!(CacheTier::L2.label(), "l2");
        assert_eq!(CacheTier::L3.to_string(), "L3");
        assert_eq!(serde_json::to_string(&CacheTier::L1).unwrap(), "\"L1\"");
    }
}
