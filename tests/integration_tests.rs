//! Depot Integration Tests
//!
//! End-to-end behaviour of:
//! - The three-tier artifact cache
//! - Quorum replication and node health
//! - The tenant-scoped replicator

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

// =============================================================================
// Cache
// =============================================================================

mod cache_tests {
    use super::*;
    use depot::cache::{
        CacheConfig, CacheKey, CacheManager, CacheTier, ColdStore, L2Config, ListQuery,
        MemoryL1Store,
    };
    use depot::checksum::sha256_hex;
    use depot::storage::InMemoryObjectStore;
    use tokio::io::AsyncReadExt;

    fn manager_with(dir: &TempDir, l3: Option<ColdStore>) -> (Arc<MemoryL1Store>, CacheManager) {
        let l1 = Arc::new(MemoryL1Store::new());
        let config = CacheConfig {
            l1_threshold: 1024,
            l2_threshold: 64 * 1024,
            l2: L2Config {
                cache_dir: dir.path().join("l2"),
                max_age: None,
            },
            ..Default::default()
        };
        let manager = CacheManager::new(config, l1.clone(), l3);
        (l1, manager)
    }

    #[tokio::test]
    async fn test_lodash_evicted_from_l1_is_served_from_l2_and_repopulated() {
        let dir = TempDir::new().unwrap();
        let l1 = Arc::new(MemoryL1Store::new());
        let manager = CacheManager::new(
            CacheConfig {
                l2: L2Config {
                    cache_dir: dir.path().to_path_buf(),
                    max_age: None,
                },
                ..Default::default()
            },
            l1.clone(),
            None,
        );

        let key = CacheKey::parse("npm:lodash-4.17.21.tgz").unwrap();
        let data = Bytes::from(vec![0x1f; 500 * 1024]);
        let checksum = sha256_hex(&data);

        manager
            .set(
                &key,
                data.clone(),
                "application/gzip",
                Some(&checksum),
                Some(Duration::from_secs(24 * 3600)),
            )
            .await
            .unwrap();
        assert_eq!(manager.locate(&key).await, vec![CacheTier::L1, CacheTier::L2]);

        let hit = manager.get(&key).await.unwrap();
        assert_eq!(hit.source, CacheTier::L1);
        assert_eq!(hit.data, data);
        assert_eq!(hit.content_type, "application/gzip");
        assert_eq!(hit.checksum, checksum);

        assert!(l1.evict("npm:lodash-4.17.21.tgz"));

        let hit = manager.get(&key).await.unwrap();
        assert_eq!(hit.source, CacheTier::L2);
        assert_eq!(hit.data, data);
        assert_eq!(hit.content_type, "application/gzip");

        manager.drain_promotions().await;
        let hit = manager.get(&key).await.unwrap();
        assert_eq!(hit.source, CacheTier::L1);
        assert_eq!(manager.promotion_stats().completed, 1);
    }

    #[tokio::test]
    async fn test_size_routing() {
        let dir = TempDir::new().unwrap();
        let cold = InMemoryObjectStore::named("cold");
        let (_l1, manager) = manager_with(&dir, Some(ColdStore::new(Arc::new(cold), "cold", "")));

        let small = CacheKey::new("npm", "small.tgz");
        let medium = CacheKey::new("maven", "medium.jar");
        let large = CacheKey::new("docker", "library/nginx/blobs/sha256:abc");

        manager
            .set(&small, Bytes::from(vec![1; 100]), "application/gzip", None, None)
            .await
            .unwrap();
        manager
            .set(&medium, Bytes::from(vec![2; 4096]), "application/java-archive", None, None)
            .await
            .unwrap();
        manager
            .set(&large, Bytes::from(vec![3; 128 * 1024]), "application/octet-stream", None, None)
            .await
            .unwrap();

        assert_eq!(manager.locate(&small).await, vec![CacheTier::L1, CacheTier::L2]);
        assert_eq!(manager.locate(&medium).await, vec![CacheTier::L2]);
        assert_eq!(manager.locate(&large).await, vec![CacheTier::L3]);
        assert_eq!(manager.get(&large).await.unwrap().source, CacheTier::L3);
    }

    #[tokio::test]
    async fn test_large_artifact_without_l3_goes_to_l2() {
        let dir = TempDir::new().unwrap();
        let (_l1, manager) = manager_with(&dir, None);
        let key = CacheKey::new("pypi", "torch-2.0.whl");

        manager
            .set(&key, Bytes::from(vec![9; 128 * 1024]), "application/zip", None, None)
            .await
            .unwrap();
        assert_eq!(manager.locate(&key).await, vec![CacheTier::L2]);
    }

    #[tokio::test]
    async fn test_small_l3_hit_is_promoted_to_l1_and_l2() {
        let dir = TempDir::new().unwrap();
        let cold = Arc::new(InMemoryObjectStore::named("cold"));
        let cold_store = ColdStore::new(cold.clone(), "cold", "cache/");
        cold_store
            .set("npm:tiny.tgz", Bytes::from_static(b"tiny"), "application/gzip")
            .await
            .unwrap();
        let (_l1, manager) = manager_with(&dir, Some(cold_store));
        let key = CacheKey::new("npm", "tiny.tgz");

        let hit = manager.get(&key).await.unwrap();
        assert_eq!(hit.source, CacheTier::L3);

        manager.drain_promotions().await;
        assert_eq!(
            manager.locate(&key).await,
            vec![CacheTier::L1, CacheTier::L2, CacheTier::L3]
        );
    }

    #[tokio::test]
    async fn test_invalidate_removes_every_tier() {
        let dir = TempDir::new().unwrap();
        let (_l1, manager) = manager_with(&dir, None);
        let key = CacheKey::new("helm", "charts/nginx-1.0.0.tgz");

        manager
            .set(&key, Bytes::from_static(b"chart"), "application/gzip", None, None)
            .await
            .unwrap();
        assert!(manager.invalidate(&key).await);
        assert!(manager.get(&key).await.is_none());
        assert!(!manager.contains(&key).await);
        assert!(!manager.invalidate(&key).await);
    }

    #[tokio::test]
    async fn test_reader_streams_from_disk() {
        let dir = TempDir::new().unwrap();
        let (_l1, manager) = manager_with(&dir, None);
        let key = CacheKey::new("maven", "org/acme/lib-1.0.jar");
        let data = Bytes::from(vec![7u8; 8 * 1024]);

        manager
            .set(&key, data.clone(), "application/java-archive", None, None)
            .await
            .unwrap();

        let mut reader = manager.get_reader(&key).await.unwrap();
        assert_eq!(reader.source, CacheTier::L2);
        assert_eq!(reader.size, data.len() as u64);
        assert_eq!(reader.content_type, "application/java-archive");

        let mut buf = Vec::new();
        reader.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, data.as_ref());
    }

    #[tokio::test]
    async fn test_listing_and_stats_across_tiers() {
        let dir = TempDir::new().unwrap();
        let (l1, manager) = manager_with(&dir, None);

        for (key, size) in [
            ("npm:lodash-4.17.21.tgz", 100),
            ("npm:react-18.2.0.tgz", 200),
            ("maven:org/acme/lib-1.0.jar", 4096),
        ] {
            let key = CacheKey::parse(key).unwrap();
            manager
                .set(&key, Bytes::from(vec![0; size]), "application/octet-stream", None, None)
                .await
                .unwrap();
        }
        l1.evict("npm:react-18.2.0.tgz");

        let page = manager
            .list_items(&ListQuery {
                artifact_type: Some("NPM".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].key, "npm:lodash-4.17.21.tgz");
        assert_eq!(page.items[0].tier, CacheTier::L1);
        assert_eq!(page.items[1].tier, CacheTier::L2);

        let page = manager
            .list_items(&ListQuery {
                search: Some("acme".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].artifact_type, "maven");

        let stats = manager.get_cache_stats().await.unwrap();
        assert_eq!(stats.l1.items, 1);
        assert_eq!(stats.l2.items, 3);
        assert_eq!(stats.l2.bytes, 100 + 200 + 4096);
        assert!(stats.l3.is_none());
    }

    #[tokio::test]
    async fn test_flush_tiers() {
        let dir = TempDir::new().unwrap();
        let (_l1, manager) = manager_with(&dir, None);
        for i in 0..5 {
            let key = CacheKey::new("npm", format!("pkg-{}.tgz", i));
            manager
                .set(&key, Bytes::from_static(b"x"), "application/gzip", None, None)
                .await
                .unwrap();
        }

        assert_eq!(manager.flush_l1().await.unwrap(), 5);
        assert_eq!(manager.flush_l2().await.unwrap(), 5);
        assert_eq!(manager.flush_l3().await.unwrap(), 0);
        assert!(manager.get(&CacheKey::new("npm", "pkg-0.tgz")).await.is_none());
    }
}

// =============================================================================
// Replication
// =============================================================================

mod replication_tests {
    use super::*;
    use assert_matches::assert_matches;
    use depot::checksum::sha256_hex;
    use depot::replication::{
        NodeHealthMonitor, NodeRow, QuorumPolicy, ReplicationEngine, StorageNode,
    };
    use depot::storage::InMemoryObjectStore;
    use depot::Error;

    fn local_engine(dir: &TempDir) -> ReplicationEngine {
        let rows: Vec<NodeRow> = (1..=3)
            .map(|i| {
                NodeRow::local(
                    format!("node-{}", i),
                    dir.path().join(format!("node-{}", i)).to_string_lossy(),
                    i,
                )
            })
            .collect();
        let nodes = depot::replication::build_nodes(&rows);
        ReplicationEngine::new("acme", nodes, QuorumPolicy::default())
    }

    fn memory_engine() -> (Vec<Arc<InMemoryObjectStore>>, ReplicationEngine) {
        let stores: Vec<_> = (1..=3)
            .map(|i| Arc::new(InMemoryObjectStore::named(format!("node-{}", i))))
            .collect();
        let nodes = stores
            .iter()
            .enumerate()
            .map(|(i, s)| StorageNode::with_store(format!("node-{}", i + 1), i as i32, s.clone()))
            .collect();
        (stores, ReplicationEngine::new("acme", nodes, QuorumPolicy::Majority))
    }

    #[tokio::test]
    async fn test_three_local_nodes() {
        let dir = TempDir::new().unwrap();
        let engine = local_engine(&dir);
        let data = Bytes::from_static(b"lodash tarball");

        let result = engine
            .replicate_file("artifacts", "npm/lodash-4.17.21.tgz", data.clone(), Some("application/gzip"))
            .await;
        assert!(result.success);
        assert_eq!(result.actual_replicas, 3);
        assert_eq!(result.replicated_nodes.len(), 3);
        assert_eq!(result.checksum, sha256_hex(&data));

        for i in 1..=3 {
            let path = dir
                .path()
                .join(format!("node-{}/artifacts/npm/lodash-4.17.21.tgz", i));
            assert_eq!(std::fs::read(path).unwrap(), data.as_ref());
        }
        assert_eq!(
            engine.read_file("artifacts", "npm/lodash-4.17.21.tgz").await.unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_quorum_with_failures() {
        let (stores, engine) = memory_engine();

        stores[2].set_fail_writes(true);
        let result = engine.replicate_file("b", "a", Bytes::from_static(b"1"), None).await;
        assert!(result.success);
        assert_eq!(result.failed_nodes, vec!["node-3"]);

        stores[1].set_fail_writes(true);
        let result = engine.replicate_file("b", "a", Bytes::from_static(b"1"), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("insufficient replicas"));
    }

    #[tokio::test]
    async fn test_one_flipped_byte_is_corruption() {
        let (stores, engine) = memory_engine();
        engine
            .replicate_file("b", "pkg.whl", Bytes::from_static(b"wheel"), None)
            .await;
        stores[0].corrupt("b", "pkg.whl");

        let result = engine.verify_replication("b", "pkg.whl").await;
        assert!(!result.success);
        assert_matches!(result.check(), Err(Error::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_probe_state_machine() {
        let (stores, engine) = memory_engine();
        let monitor: NodeHealthMonitor = engine.health_monitor("b", Duration::from_secs(1));

        stores[0].set_fail_probes(true);
        for _ in 0..3 {
            monitor.check_now().await;
        }
        let status = engine.get_health_status();
        assert!(!status["node-1"].is_healthy);
        assert_eq!(status["node-1"].failure_count, 3);

        stores[0].set_fail_probes(false);
        monitor.check_now().await;
        let status = engine.get_health_status();
        assert!(status["node-1"].is_healthy);
        assert_eq!(status["node-1"].failure_count, 0);
    }

    #[tokio::test]
    async fn test_local_probe_detects_unwritable_root() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let row = NodeRow::local("broken", blocker.to_string_lossy(), 1);
        let engine = ReplicationEngine::new(
            "acme",
            depot::replication::build_nodes(&[row]),
            QuorumPolicy::Majority,
        );

        let results = engine
            .health_monitor("artifacts", Duration::from_secs(1))
            .check_now()
            .await;
        assert_eq!(results.get("broken"), Some(&false));
    }
}

// =============================================================================
// Unified Replicator
// =============================================================================

mod unified_tests {
    use super::*;
    use std::collections::HashMap;

    use depot::replication::{
        NodeRow, ReplicationRequest, ReplicationSettings, StaticNodeSource, UnifiedReplicator,
    };
    use depot::DepotConfig;

    #[tokio::test]
    async fn test_config_file_to_replicated_artifact() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display();
        let raw = format!(
            "replication:\n  health_check_interval_secs: 0\n  quorum: all\ntenants:\n  acme:\n    - id: a\n      node_path: {root}/a\n      priority: 2\n    - id: b\n      node_path: {root}/b\n      priority: 1\n"
        );
        let config = DepotConfig::from_yaml(&raw).unwrap();
        let rep = UnifiedReplicator::new(
            Arc::new(StaticNodeSource::new(config.tenants.clone())),
            config.replication.clone(),
        );

        let req = ReplicationRequest {
            tenant_id: "acme".to_string(),
            repository_id: "npm-proxy".to_string(),
            artifact_id: "lodash-4.17.21.tgz".to_string(),
            artifact_type: "npm".to_string(),
            data: Bytes::from_static(b"tarball"),
            ..Default::default()
        };
        let result = rep.replicate_artifact(&req).await.unwrap();
        assert!(result.success);
        assert_eq!(result.required_replicas, 2);

        let status = rep.get_replication_status("acme").await.unwrap();
        assert_eq!(status.nodes[0].id, "b");
        assert!(status.quorum_available);
        assert!(dir
            .path()
            .join("a/artifacts/npm-proxy/lodash-4.17.21.tgz")
            .exists());
    }

    #[tokio::test]
    async fn test_invalidation_reloads_nodes() {
        let dir = TempDir::new().unwrap();
        let settings = ReplicationSettings {
            health_check_interval_secs: 0,
            default_nodes: vec![NodeRow::local(
                "fallback",
                dir.path().join("fallback").to_string_lossy(),
                1,
            )],
            ..Default::default()
        };
        let rep = UnifiedReplicator::new(Arc::new(StaticNodeSource::new(HashMap::new())), settings);

        let status = rep.get_replication_status("unknown").await.unwrap();
        assert_eq!(status.total_nodes, 1);
        assert_eq!(status.nodes[0].id, "fallback");
        assert_eq!(rep.cached_tenants().await, vec!["unknown"]);

        assert!(rep.invalidate_cache("unknown").await);
        assert!(rep.cached_tenants().await.is_empty());
    }
}

// =============================================================================
// Properties
// =============================================================================

mod property_tests {
    use depot::cache::{decode_key, encode_key, glob_match, CacheKey};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encoded_keys_round_trip_to_safe_names(key in "\\PC{1,64}") {
            let encoded = encode_key(&key);
            prop_assert!(!encoded.starts_with('.'));
            prop_assert!(!encoded.contains('/'));
            prop_assert_eq!(decode_key(&encoded), Some(key));
        }

        #[test]
        fn star_matches_everything(text in "\\PC{0,32}") {
            prop_assert!(glob_match("*", &text));
        }

        #[test]
        fn literal_pattern_matches_itself(text in "[a-z0-9:/._-]{0,32}") {
            prop_assert!(glob_match(&text, &text));
        }

        #[test]
        fn type_prefix_glob_matches_keys(ty in "[a-z]{1,8}", path in "[a-z0-9/._-]{1,32}") {
            let key = CacheKey::new(ty.clone(), path).to_string();
            let pattern = format!("{}:*", ty);
            prop_assert!(glob_match(&pattern, &key));
        }
    }
}
