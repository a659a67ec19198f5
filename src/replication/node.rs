//! Storage Node Configuration
//!
//! Rows from the persistence collaborator are validated once, at load time,
//! into a [`NodeConfig`] variant and then into a [`StorageNode`] that owns a
//! ready-to-use [`ObjectStore`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::{LocalObjectStore, ObjectStore, S3ObjectStore, S3Settings, StoredObject};

/// Default region for S3-compatible nodes without one
const DEFAULT_REGION: &str = "us-east-1";

/// GCS XML interoperability endpoint
const GCS_ENDPOINT: &str = "storage.googleapis.com";

// =============================================================================
// Persistence rows
// =============================================================================

/// One node row as stored per tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRow {
    pub id: String,
    pub node_name: String,
    pub node_path: Option<String>,
    pub priority: i32,
    pub node_type: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_use_ssl: bool,
    pub s3_path_prefix: Option<String>,
    /// Whole-request bound for S3-family nodes; unset or 0 means none
    pub s3_request_timeout_secs: Option<u64>,
    pub is_active: bool,
}

impl Default for NodeRow {
    fn default() -> Self {
        Self {
            id: String::new(),
            node_name: String::new(),
            node_path: None,
            priority: 0,
            node_type: "local".to_string(),
            s3_endpoint: None,
            s3_region: None,
            s3_bucket: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_use_ssl: true,
            s3_path_prefix: None,
            s3_request_timeout_secs: None,
            is_active: true,
        }
    }
}

impl NodeRow {
    /// Local filesystem node row
    pub fn local(id: impl Into<String>, path: impl Into<String>, priority: i32) -> Self {
        let id = id.into();
        Self {
            node_name: id.clone(),
            id,
            node_path: Some(path.into()),
            priority,
            ..Default::default()
        }
    }

    fn label(&self) -> String {
        if self.id.is_empty() {
            self.node_name.clone()
        } else {
            self.id.clone()
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Access key pair for S3-compatible backends
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Connection details shared by the S3-compatible node kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBucket {
    /// Fixed bucket; when `None` the caller's bucket is used
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    pub region: String,
    pub credentials: Credentials,
    pub use_ssl: bool,
    pub path_prefix: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl RemoteBucket {
    fn settings(&self) -> S3Settings {
        S3Settings {
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            access_key: self.credentials.access_key.clone(),
            secret_key: self.credentials.secret_key.clone(),
            use_ssl: self.use_ssl,
            path_prefix: self.path_prefix.clone(),
            request_timeout: self.request_timeout,
            ..Default::default()
        }
    }
}

/// Validated node configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeConfig {
    Local { path: PathBuf },
    S3(RemoteBucket),
    MinIO(RemoteBucket),
    Gcs(RemoteBucket),
    /// Reached through an S3-compatible gateway endpoint
    Azure(RemoteBucket),
}

impl NodeConfig {
    /// Validate a persistence row
    pub fn from_row(row: &NodeRow) -> Result<Self> {
        let node = row.label();
        let invalid = |reason: &str| Error::InvalidNodeConfig {
            node: node.clone(),
            reason: reason.to_string(),
        };

        let kind = NodeType::from_str(&row.node_type).map_err(|_| {
            invalid(&format!("unknown node type '{}'", row.node_type))
        })?;

        let remote = || -> Result<RemoteBucket> {
            let credentials = match (non_empty(&row.s3_access_key), non_empty(&row.s3_secret_key)) {
                (Some(access_key), Some(secret_key)) => Credentials {
                    access_key,
                    secret_key,
                },
                _ => return Err(invalid("access key and secret key are required")),
            };
            Ok(RemoteBucket {
                bucket: non_empty(&row.s3_bucket),
                endpoint: non_empty(&row.s3_endpoint),
                region: non_empty(&row.s3_region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
                credentials,
                use_ssl: row.s3_use_ssl,
                path_prefix: non_empty(&row.s3_path_prefix),
                request_timeout: row
                    .s3_request_timeout_secs
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            })
        };

        match kind {
            NodeType::Local => {
                let path = non_empty(&row.node_path)
                    .ok_or_else(|| invalid("local node requires a path"))?;
                Ok(NodeConfig::Local {
                    path: PathBuf::from(path),
                })
            }
            NodeType::S3 => Ok(NodeConfig::S3(remote()?)),
            NodeType::MinIO => {
                let remote = remote()?;
                if remote.endpoint.is_none() {
                    return Err(invalid("minio node requires an endpoint"));
                }
                Ok(NodeConfig::MinIO(remote))
            }
            NodeType::Gcs => {
                let mut remote = remote()?;
                remote.endpoint.get_or_insert_with(|| GCS_ENDPOINT.to_string());
                if non_empty(&row.s3_region).is_none() {
                    remote.region = "auto".to_string();
                }
                Ok(NodeConfig::Gcs(remote))
            }
            NodeType::Azure => {
                let remote = remote()?;
                if remote.endpoint.is_none() {
                    return Err(invalid("azure node requires an S3-compatible gateway endpoint"));
                }
                Ok(NodeConfig::Azure(remote))
            }
            NodeType::Custom => Err(invalid("custom nodes cannot be configured from rows")),
        }
    }

    /// Node kind
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Local { .. } => NodeType::Local,
            NodeConfig::S3(_) => NodeType::S3,
            NodeConfig::MinIO(_) => NodeType::MinIO,
            NodeConfig::Gcs(_) => NodeType::Gcs,
            NodeConfig::Azure(_) => NodeType::Azure,
        }
    }

    /// Build the backing object store
    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        Ok(match self {
            NodeConfig::Local { path } => Arc::new(LocalObjectStore::new(path)),
            NodeConfig::S3(remote)
            | NodeConfig::MinIO(remote)
            | NodeConfig::Gcs(remote)
            | NodeConfig::Azure(remote) => Arc::new(S3ObjectStore::new(remote.settings())?),
        })
    }

    fn fixed_bucket(&self) -> Option<&str> {
        match self {
            NodeConfig::Local { .. } => None,
            NodeConfig::S3(r) | NodeConfig::MinIO(r) | NodeConfig::Gcs(r) | NodeConfig::Azure(r) => {
                r.bucket.as_deref()
            }
        }
    }
}

/// Storage node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Local,
    S3,
    #[serde(rename = "minio")]
    MinIO,
    Gcs,
    Azure,
    /// Store injected programmatically
    Custom,
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "local" | "filesystem" | "fs" => Ok(NodeType::Local),
            "s3" | "aws" => Ok(NodeType::S3),
            "minio" => Ok(NodeType::MinIO),
            "gcs" | "google" => Ok(NodeType::Gcs),
            "azure" => Ok(NodeType::Azure),
            other => Err(Error::Config(format!("unknown node type '{}'", other))),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Local => "local",
            NodeType::S3 => "s3",
            NodeType::MinIO => "minio",
            NodeType::Gcs => "gcs",
            NodeType::Azure => "azure",
            NodeType::Custom => "custom",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Storage nodes
// =============================================================================

/// A replication target with its open object store
#[derive(Clone)]
pub struct StorageNode {
    id: String,
    name: String,
    priority: i32,
    node_type: NodeType,
    fixed_bucket: Option<String>,
    store: Arc<dyn ObjectStore>,
}

impl fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("node_type", &self.node_type)
            .field("location", &self.store.describe())
            .finish()
    }
}

impl StorageNode {
    /// Build a node from validated configuration
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        config: &NodeConfig,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            name: name.into(),
            priority,
            node_type: config.node_type(),
            fixed_bucket: config.fixed_bucket().map(str::to_string),
            store: config.build_store()?,
        })
    }

    /// Build a node over an existing store
    pub fn with_store(
        id: impl Into<String>,
        priority: i32,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            priority,
            node_type: NodeType::Custom,
            fixed_bucket: None,
            store,
        }
    }

    /// Validate and build a node from a persistence row
    pub fn from_row(row: &NodeRow) -> Result<Self> {
        let id = row.label();
        if id.is_empty() {
            return Err(Error::InvalidNodeConfig {
                node: "<unnamed>".to_string(),
                reason: "node has neither id nor name".to_string(),
            });
        }
        let name = if row.node_name.is_empty() {
            id.clone()
        } else {
            row.node_name.clone()
        };
        let config = NodeConfig::from_row(row)?;
        Self::new(id, name, row.priority, &config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower values are read first
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Human-readable location
    pub fn location(&self) -> String {
        self.store.describe()
    }

    /// Bucket this node actually writes to for a requested bucket
    pub fn bucket_for<'a>(&'a self, requested: &'a str) -> &'a str {
        self.fixed_bucket.as_deref().unwrap_or(requested)
    }

    pub async fn put(
        &self,
        bucket: &str,
        filename: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.store
            .put_object(self.bucket_for(bucket), filename, data, content_type)
            .await
    }

    pub async fn get(&self, bucket: &str, filename: &str) -> Result<Option<StoredObject>> {
        self.store.get_object(self.bucket_for(bucket), filename).await
    }

    pub async fn delete(&self, bucket: &str, filename: &str) -> Result<bool> {
        self.store
            .delete_object(self.bucket_for(bucket), filename)
            .await
    }

    pub async fn probe(&self, bucket: &str) -> Result<()> {
        self.store.probe(self.bucket_for(bucket)).await
    }
}

/// Build nodes from rows: inactive rows are skipped, invalid rows are logged
/// and skipped, the rest are sorted by priority.
pub fn build_nodes(rows: &[NodeRow]) -> Vec<StorageNode> {
    let mut nodes: Vec<StorageNode> = rows
        .iter()
        .filter(|row| {
            if !row.is_active {
                debug!(node = %row.label(), "skipping inactive node");
            }
            row.is_active
        })
        .filter_map(|row| match StorageNode::from_row(row) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(node = %row.label(), error = %e, "skipping invalid node configuration");
                None
            }
        })
        .collect();
    nodes.sort_by_key(|n| n.priority);
    nodes
}

// =============================================================================
// Quorum
// =============================================================================

/// How many successful node writes make a replication durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "QuorumRepr", into = "QuorumRepr")]
pub enum QuorumPolicy {
    /// `n / 2 + 1`
    #[default]
    Majority,
    /// Every configured node
    All,
    /// A fixed count, not clamped to the node count
    Fixed(usize),
}

impl QuorumPolicy {
    /// Required successful writes for `node_count` nodes (at least 1)
    pub fn required(&self, node_count: usize) -> usize {
        let required = match self {
            QuorumPolicy::Majority => node_count / 2 + 1,
            QuorumPolicy::All => node_count,
            QuorumPolicy::Fixed(k) => *k,
        };
        required.max(1)
    }
}

impl FromStr for QuorumPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "majority" => Ok(QuorumPolicy::Majority),
            "all" => Ok(QuorumPolicy::All),
            other => other
                .parse::<usize>()
                .map(QuorumPolicy::Fixed)
                .map_err(|_| Error::Config(format!("invalid quorum '{}'", s))),
        }
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumPolicy::Majority => f.write_str("majority"),
            QuorumPolicy::All => f.write_str("all"),
            QuorumPolicy::Fixed(k) => write!(f, "{}", k),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum QuorumRepr {
    Count(usize),
    Name(String),
}

impl TryFrom<QuorumRepr> for QuorumPolicy {
    type Error = Error;

    fn try_from(repr: QuorumRepr) -> Result<Self> {
        match repr {
            QuorumRepr::Count(k) => Ok(QuorumPolicy::Fixed(k)),
            QuorumRepr::Name(name) => name.parse(),
        }
    }
}

impl From<QuorumPolicy> for QuorumRepr {
    fn from(policy: QuorumPolicy) -> Self {
        match policy {
            QuorumPolicy::Fixed(k) => QuorumRepr::Count(k),
            other => QuorumRepr::Name(other.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
