//! Configuration
//!
//! `DepotConfig` is read from YAML; every section has defaults so an empty
//! file (or no file) is a valid configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{CacheConfig, ColdStore, L1Config, L2Config, L1_THRESHOLD, L2_THRESHOLD};
use crate::error::{Error, Result};
use crate::replication::{NodeRow, ReplicationSettings};
use crate::storage::{LocalObjectStore, ObjectStore, S3ObjectStore, S3Settings};

/// Comma-separated local replica paths used when a tenant has no nodes
pub const REPLICA_PATHS_ENV: &str = "DEPOT_REPLICA_PATHS";

const DEFAULT_REPLICA_ROOT: &str = "./data/replicas";

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    pub cache: CacheSection,
    pub replication: ReplicationSettings,
    /// Tenant id → node rows
    pub tenants: HashMap<String, Vec<NodeRow>>,
}

impl DepotConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&raw)?;
        info!(
            path = %path.display(),
            tenants = config.tenants.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Cache tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub l1_threshold: u64,
    pub l2_threshold: u64,
    /// L1 capacity in bytes
    pub l1_capacity: u64,
    pub l2_dir: PathBuf,
    /// Seconds before an L2 entry expires; 0 keeps entries until flushed
    pub l2_max_age_secs: u64,
    pub l3_enabled: bool,
    pub l3_bucket: String,
    pub l3_prefix: String,
    /// S3-compatible endpoint; without one L3 lives under `l3_dir`
    pub l3_endpoint: Option<String>,
    pub l3_region: Option<String>,
    pub l3_access_key: Option<String>,
    pub l3_secret_key: Option<String>,
    pub l3_use_ssl: bool,
    /// Whole-request bound for L3 uploads and downloads; 0 means none
    pub l3_request_timeout_secs: u64,
    pub l3_dir: PathBuf,
    pub promotion_workers: usize,
    pub promotion_queue: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            l1_threshold: L1_THRESHOLD,
            l2_threshold: L2_THRESHOLD,
            l1_capacity: 1024 * 1024 * 1024,
            l2_dir: PathBuf::from("./data/cache"),
            l2_max_age_secs: 0,
            l3_enabled: false,
            l3_bucket: "depot-cache".to_string(),
            l3_prefix: "cache/".to_string(),
            l3_endpoint: None,
            l3_region: None,
            l3_access_key: None,
            l3_secret_key: None,
            l3_use_ssl: true,
            l3_request_timeout_secs: 0,
            l3_dir: PathBuf::from("./data/cold"),
            promotion_workers: 4,
            promotion_queue: 256,
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> Result<CacheConfig> {
        if self.l1_threshold > self.l2_threshold {
            return Err(Error::Config(format!(
                "l1_threshold ({}) exceeds l2_threshold ({})",
                self.l1_threshold, self.l2_threshold
            )));
        }
        Ok(CacheConfig {
            l1_threshold: self.l1_threshold,
            l2_threshold: self.l2_threshold,
            l2: L2Config {
                cache_dir: self.l2_dir.clone(),
                max_age: (self.l2_max_age_secs > 0)
                    .then(|| Duration::from_secs(self.l2_max_age_secs)),
            },
            promotion_workers: self.promotion_workers,
            promotion_queue: self.promotion_queue,
        })
    }

    pub fn l1_config(&self) -> L1Config {
        L1Config {
            capacity: self.l1_capacity,
            ..Default::default()
        }
    }

    pub fn l3_request_timeout(&self) -> Option<Duration> {
        (self.l3_request_timeout_secs > 0).then(|| Duration::from_secs(self.l3_request_timeout_secs))
    }

    /// The cold tier, or `None` when L3 is disabled
    pub fn build_cold_store(&self) -> Result<Option<ColdStore>> {
        if !self.l3_enabled {
            return Ok(None);
        }
        if self.l3_bucket.trim().is_empty() {
            return Err(Error::Config("l3_bucket is required when L3 is enabled".to_string()));
        }

        let backend: Arc<dyn ObjectStore> = match self.l3_endpoint.as_deref() {
            Some(endpoint) if !endpoint.trim().is_empty() => {
                let (Some(access_key), Some(secret_key)) =
                    (self.l3_access_key.clone(), self.l3_secret_key.clone())
                else {
                    return Err(Error::Config(
                        "l3_access_key and l3_secret_key are required with l3_endpoint".to_string(),
                    ));
                };
                Arc::new(S3ObjectStore::new(S3Settings {
                    endpoint: Some(endpoint.to_string()),
                    region: self
                        .l3_region
                        .clone()
                        .unwrap_or_else(|| "us-east-1".to_string()),
                    access_key,
                    secret_key,
                    use_ssl: self.l3_use_ssl,
                    request_timeout: self.l3_request_timeout(),
                    ..Default::default()
                })?)
            }
            _ => Arc::new(LocalObjectStore::new(self.l3_dir.clone())),
        };
        Ok(Some(ColdStore::new(
            backend,
            self.l3_bucket.clone(),
            self.l3_prefix.clone(),
        )))
    }
}

/// Default nodes from `DEPOT_REPLICA_PATHS`, or three local nodes
pub fn default_node_rows() -> Vec<NodeRow> {
    default_node_rows_from(std::env::var(REPLICA_PATHS_ENV).ok().as_deref())
}

/// Default nodes from a comma-separated path list
pub fn default_node_rows_from(paths: Option<&str>) -> Vec<NodeRow> {
    let paths: Vec<String> = match paths {
        Some(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        _ => (1..=3)
            .map(|i| format!("{}/node-{}", DEFAULT_REPLICA_ROOT, i))
            .collect(),
    };

    paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| NodeRow::local(format!("node-{}", i + 1), path, i as i32 + 1))
        .collect()
}
