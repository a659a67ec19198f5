//! Unified Replicator
//!
//! Tenant-scoped front end over [`ReplicationEngine`]. Engines are built
//! lazily from each tenant's node rows and cached until invalidated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::engine::{ReplicationEngine, ReplicationResult};
use super::health::NodeHealth;
use super::node::{build_nodes, NodeRow, NodeType, QuorumPolicy};
use crate::config::default_node_rows;
use crate::error::{Error, Result};
use crate::tasks::{TaskHandle, TaskPool};

/// Source of per-tenant node configuration
#[async_trait]
pub trait NodeConfigSource: Send + Sync {
    /// Node rows for a tenant; an empty list means "use defaults"
    async fn load_nodes(&self, tenant_id: &str) -> Result<Vec<NodeRow>>;
}

/// Node rows held in memory, typically from the config file's `tenants` map
#[derive(Debug, Clone, Default)]
pub struct StaticNodeSource {
    tenants: HashMap<String, Vec<NodeRow>>,
}

impl StaticNodeSource {
    pub fn new(tenants: HashMap<String, Vec<NodeRow>>) -> Self {
        Self { tenants }
    }
}

#[async_trait]
impl NodeConfigSource for StaticNodeSource {
    async fn load_nodes(&self, tenant_id: &str) -> Result<Vec<NodeRow>> {
        Ok(self.tenants.get(tenant_id).cloned().unwrap_or_default())
    }
}

/// Replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    pub quorum: QuorumPolicy,
    pub default_bucket: String,
    /// 0 disables the background monitor
    pub health_check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Budget for a dispatched replication, independent of the caller
    pub replication_timeout_secs: u64,
    pub dispatch_workers: usize,
    pub dispatch_queue: usize,
    /// Used when a tenant has no usable rows of its own
    pub default_nodes: Vec<NodeRow>,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            quorum: QuorumPolicy::Majority,
            default_bucket: "artifacts".to_string(),
            health_check_interval_secs: 30,
            probe_timeout_secs: 10,
            replication_timeout_secs: 300,
            dispatch_workers: 8,
            dispatch_queue: 1024,
            default_nodes: Vec::new(),
        }
    }
}

impl ReplicationSettings {
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_timeout_secs.max(1))
    }
}

/// A request to replicate one artifact
#[derive(Debug, Clone, Default)]
pub struct ReplicationRequest {
    pub tenant_id: String,
    pub repository_id: String,
    pub artifact_id: String,
    pub artifact_type: String,
    pub data: Bytes,
    pub metadata: HashMap<String, String>,
    pub bucket_name: Option<String>,
    pub file_name: Option<String>,
}

impl ReplicationRequest {
    /// `file_name` when set, otherwise `<repository>/<artifact>`
    pub fn object_path(&self) -> String {
        match self.file_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}/{}", self.repository_id, self.artifact_id),
        }
    }

    fn bucket<'a>(&'a self, default: &'a str) -> &'a str {
        match self.bucket_name.as_deref() {
            Some(b) if !b.is_empty() => b,
            _ => default,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::InvalidRequest("tenant_id is required".to_string()));
        }
        if self.data.is_empty() {
            return Err(Error::InvalidRequest("data must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Status of one node, for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub priority: i32,
    pub location: String,
    pub health: NodeHealth,
}

/// Replication status of a tenant
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub tenant_id: String,
    pub nodes: Vec<NodeStatus>,
    pub healthy_nodes: usize,
    pub total_nodes: usize,
    pub required_replicas: usize,
    pub quorum_available: bool,
}

/// Tenant-scoped replication service
pub struct UnifiedReplicator {
    source: Arc<dyn NodeConfigSource>,
    settings: ReplicationSettings,
    engines: RwLock<HashMap<String, Arc<ReplicationEngine>>>,
    dispatcher: TaskPool,
}

impl UnifiedReplicator {
    pub fn new(source: Arc<dyn NodeConfigSource>, settings: ReplicationSettings) -> Self {
        let dispatcher = TaskPool::new(
            "replication-dispatch",
            settings.dispatch_workers,
            settings.dispatch_queue,
        );
        Self {
            source,
            settings,
            engines: RwLock::new(HashMap::new()),
            dispatcher,
        }
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &TaskPool {
        &self.dispatcher
    }

    /// The tenant's engine, building it on first use
    pub async fn engine(&self, tenant_id: &str) -> Result<Arc<ReplicationEngine>> {
        if let Some(engine) = self.engines.read().await.get(tenant_id) {
            return Ok(Arc::clone(engine));
        }

        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(tenant_id) {
            return Ok(Arc::clone(engine));
        }

        let engine = Arc::new(self.build_engine(tenant_id).await?);
        engines.insert(tenant_id.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    async fn build_engine(&self, tenant_id: &str) -> Result<ReplicationEngine> {
        let rows = match self.source.load_nodes(tenant_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(tenant = tenant_id, error = %e, "node configuration unavailable, using defaults");
                Vec::new()
            }
        };

        let mut nodes = build_nodes(&rows);
        if nodes.is_empty() {
            let defaults = if self.settings.default_nodes.is_empty() {
                default_node_rows()
            } else {
                self.settings.default_nodes.clone()
            };
            debug!(tenant = tenant_id, nodes = defaults.len(), "using default nodes");
            nodes = build_nodes(&defaults);
        }
        if nodes.is_empty() {
            return Err(Error::Config(format!(
                "no usable storage nodes for tenant {}",
                tenant_id
            )));
        }

        let mut engine = ReplicationEngine::new(tenant_id, nodes, self.settings.quorum);
        if let Some(interval) = self.settings.health_check_interval() {
            engine.start_monitor(
                self.settings.default_bucket.clone(),
                interval,
                self.settings.probe_timeout(),
            );
        }
        info!(
            tenant = tenant_id,
            nodes = engine.nodes().len(),
            required = engine.required_replicas(),
            "replication engine ready"
        );
        Ok(engine)
    }

    /// Replicate an artifact for its tenant.
    ///
    /// Invalid requests are rejected before any I/O. Failures after that
    /// point, including engine construction, come back as a failed result.
    pub async fn replicate_artifact(&self, req: &ReplicationRequest) -> Result<ReplicationResult> {
        req.validate()?;
        let bucket = req.bucket(&self.settings.default_bucket);
        let path = req.object_path();

        let engine = match self.engine(&req.tenant_id).await {
            Ok(engine) => engine,
            Err(e) => {
                warn!(tenant = %req.tenant_id, error = %e, "replication engine unavailable");
                return Ok(ReplicationResult::failed(bucket, &path, &e));
            }
        };

        let content_type = req.metadata.get("content_type").map(String::as_str);
        let result = engine
            .replicate_file(bucket, &path, req.data.clone(), content_type)
            .await;
        debug!(
            tenant = %req.tenant_id,
            artifact_type = %req.artifact_type,
            path = %path,
            success = result.success,
            "artifact replication finished"
        );
        Ok(result)
    }

    /// Replicate in the background with its own timeout budget.
    ///
    /// The request is validated up front. Dropping the handle does not cancel
    /// the replication.
    pub fn dispatch(self: &Arc<Self>, req: ReplicationRequest) -> Result<TaskHandle<ReplicationResult>> {
        req.validate()?;
        let this = Arc::clone(self);
        let budget = self.settings.replication_timeout();
        let label = format!("{}:{}", req.tenant_id, req.object_path());

        self.dispatcher.submit(label, async move {
            let result = tokio::time::timeout(budget, this.replicate_artifact(&req))
                .await
                .map_err(|_| Error::Timeout(budget))??;
            result.check()?;
            Ok(result)
        })
    }

    /// Compare replica checksums for an object
    pub async fn verify_artifact(
        &self,
        tenant_id: &str,
        bucket: Option<&str>,
        filename: &str,
    ) -> Result<ReplicationResult> {
        let engine = self.engine(tenant_id).await?;
        let bucket = bucket.unwrap_or(&self.settings.default_bucket);
        Ok(engine.verify_replication(bucket, filename).await)
    }

    /// Read an object from the tenant's healthiest replica
    pub async fn read_artifact(
        &self,
        tenant_id: &str,
        bucket: Option<&str>,
        filename: &str,
    ) -> Result<Bytes> {
        let engine = self.engine(tenant_id).await?;
        let bucket = bucket.unwrap_or(&self.settings.default_bucket);
        engine.read_file(bucket, filename).await
    }

    pub async fn get_replication_status(&self, tenant_id: &str) -> Result<ReplicationStatus> {
        let engine = self.engine(tenant_id).await?;
        let health = engine.get_health_status();

        let nodes: Vec<NodeStatus> = engine
            .nodes()
            .iter()
            .map(|node| NodeStatus {
                id: node.id().to_string(),
                name: node.name().to_string(),
                node_type: node.node_type(),
                priority: node.priority(),
                location: node.location(),
                health: health.get(node.id()).copied().unwrap_or_default(),
            })
            .collect();

        let healthy_nodes = nodes.iter().filter(|n| n.health.is_healthy).count();
        let required_replicas = engine.required_replicas();
        Ok(ReplicationStatus {
            tenant_id: tenant_id.to_string(),
            total_nodes: nodes.len(),
            healthy_nodes,
            required_replicas,
            quorum_available: healthy_nodes >= required_replicas,
            nodes,
        })
    }

    /// Drop a tenant's engine so the next call reloads its nodes
    pub async fn invalidate_cache(&self, tenant_id: &str) -> bool {
        let removed = self.engines.write().await.remove(tenant_id).is_some();
        if removed {
            info!(tenant = tenant_id, "replication engine invalidated");
        }
        removed
    }

    /// Drop every cached engine; returns how many were dropped
    pub async fn invalidate_all_caches(&self) -> usize {
        let mut engines = self.engines.write().await;
        let count = engines.len();
        engines.clear();
        info!(count, "all replication engines invalidated");
        count
    }

    pub async fn cached_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.engines.read().await.keys().cloned().collect();
        tenants.sort();
        tenants
    }
}

// =============================================================================
// Tests
// =============================================================================
