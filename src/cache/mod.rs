//! Three-Tiered Artifact Cache
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           CacheManager                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 (KV, TTL)          │ L2 (local disk)        │ L3 (object store)      │
//! │  < 10 MiB, with L2     │ < 1 GiB                │ ≥ 1 GiB, optional      │
//! │         ▲              │         │  ▲           │         │              │
//! │         └── promotion ─┴─────────┘  └───────────┴─────────┘              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads probe L1 → L2 → L3. Hits below the L1 threshold in slower tiers are
//! copied up asynchronously through a bounded task pool.

mod artifact;
mod key;
mod l1;
mod l2;
mod l3;
mod listing;
mod manager;

pub use artifact::{CacheTier, CachedArtifact};
pub use key::{guess_artifact_type, ttl_for_type, CacheKey, DEFAULT_TTL, DOCKER_TTL};
pub use l1::{decode_record, encode_record, glob_match, L1Config, L1Store, MemoryL1Store};
pub use l2::{decode_key, encode_key, DiskEntry, DiskStore, L2Config, DEFAULT_CONTENT_TYPE};
pub use l3::ColdStore;
pub use listing::{CacheItem, CacheStats, ListPage, ListQuery, TierStats, DEFAULT_PAGE_SIZE};
pub use manager::{CacheConfig, CacheManager, CacheReader};

/// Artifacts smaller than this are written to L1 and L2 (10 MiB)
pub const L1_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Artifacts at least this large go to L3 when enabled (1 GiB)
pub const L2_THRESHOLD: u64 = 1024 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        assert_eq!(L1_THRESHOLD, 10 * 1024 * 1024);
        assert_eq!(L2_THRESHOLD, 1024 * 1024 * 1024);
        assert!(L1_THRESHOLD < L2_THRESHOLD);
    }
}
