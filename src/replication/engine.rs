//! Replication Engine
//!
//! Fans every write out to all of a tenant's nodes, waits for all of them,
//! and declares the write durable when the quorum is met. Reads go to
//! healthy nodes in priority order with sequential fallback.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::health::{MonitorHandle, NodeHealth, NodeHealthMonitor, NodeHealthTracker};
use super::node::{QuorumPolicy, StorageNode};
use crate::checksum::sha256_hex_offload;
use crate::error::{Error, Result};
use crate::telemetry::{REPLICATIONS, REPLICATION_DURATION};

/// Outcome of a replicated write or a verification pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationResult {
    pub success: bool,
    pub bucket: String,
    pub filename: String,
    pub replicated_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub checksum: String,
    pub actual_replicas: usize,
    pub required_replicas: usize,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub elapsed: Duration,
    /// Human-readable failure, when `success` is false
    pub error: Option<String>,
    /// Distinct checksums seen across readable replicas, set on corruption
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicting_checksums: Vec<String>,
}

impl ReplicationResult {
    fn empty(bucket: &str, filename: &str, required: usize) -> Self {
        Self {
            success: false,
            bucket: bucket.to_string(),
            filename: filename.to_string(),
            replicated_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            checksum: String::new(),
            actual_replicas: 0,
            required_replicas: required,
            elapsed: Duration::ZERO,
            error: None,
            conflicting_checksums: Vec::new(),
        }
    }

    /// Failure result carrying an error message and no node outcomes
    pub fn failed(bucket: &str, filename: &str, error: &Error) -> Self {
        let mut result = Self::empty(bucket, filename, 0);
        result.error = Some(error.to_string());
        result
    }

    /// The error this result represents, if any
    pub fn check(&self) -> Result<()> {
        if !self.conflicting_checksums.is_empty() {
            return Err(Error::ChecksumMismatch {
                filename: self.filename.clone(),
                checksums: self.conflicting_checksums.clone(),
            });
        }
        if !self.success {
            if self.required_replicas == 0 {
                return Err(Error::Internal(
                    self.error.clone().unwrap_or_else(|| "replication failed".to_string()),
                ));
            }
            return Err(Error::InsufficientReplicas {
                got: self.actual_replicas,
                need: self.required_replicas,
            });
        }
        Ok(())
    }

    /// Whether the failure was replica disagreement
    pub fn is_corrupt(&self) -> bool {
        !self.conflicting_checksums.is_empty()
    }
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of a best-effort delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted_nodes: Vec<String>,
    pub missing_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
}

/// Quorum-replicating engine over one tenant's nodes
pub struct ReplicationEngine {
    tenant: String,
    nodes: Arc<[StorageNode]>,
    health: Arc<NodeHealthTracker>,
    quorum: QuorumPolicy,
    monitor: Option<MonitorHandle>,
}

impl ReplicationEngine {
    /// Create an engine; nodes are ordered by priority
    pub fn new(tenant: impl Into<String>, mut nodes: Vec<StorageNode>, quorum: QuorumPolicy) -> Self {
        let tenant = tenant.into();
        nodes.sort_by_key(|n| n.priority());
        let health = Arc::new(NodeHealthTracker::new(
            tenant.clone(),
            nodes.iter().map(|n| n.id().to_string()),
        ));
        Self {
            tenant,
            nodes: nodes.into(),
            health,
            quorum,
            monitor: None,
        }
    }

    /// Start the periodic health monitor; it stops when the engine drops
    pub fn start_monitor(
        &mut self,
        bucket: impl Into<String>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> NodeHealthMonitor {
        let monitor = self.health_monitor(bucket, probe_timeout);
        self.monitor = Some(monitor.clone().spawn(interval));
        monitor
    }

    /// A monitor over this engine's nodes, not yet running
    pub fn health_monitor(&self, bucket: impl Into<String>, probe_timeout: Duration) -> NodeHealthMonitor {
        NodeHealthMonitor::new(
            Arc::clone(&self.nodes),
            Arc::clone(&self.health),
            bucket,
            probe_timeout,
        )
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Nodes in priority order
    pub fn nodes(&self) -> &[StorageNode] {
        &self.nodes
    }

    pub fn quorum(&self) -> QuorumPolicy {
        self.quorum
    }

    /// Successful writes needed for durability with the configured nodes
    pub fn required_replicas(&self) -> usize {
        self.quorum.required(self.nodes.len())
    }

    pub fn health(&self) -> &Arc<NodeHealthTracker> {
        &self.health
    }

    /// Copy of every node's health
    pub fn get_health_status(&self) -> HashMap<String, NodeHealth> {
        self.health.snapshot()
    }

    /// Write `data` to every node and evaluate the quorum.
    ///
    /// Waits for every node, not just the first `required` ones. Node
    /// failures are recorded against node health and reported in the result;
    /// use [`ReplicationResult::check`] to turn a failed quorum into an error.
    #[instrument(skip(self, data, content_type), fields(tenant = %self.tenant, size = data.len()))]
    pub async fn replicate_file(
        &self,
        bucket: &str,
        filename: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> ReplicationResult {
        let start = Instant::now();
        let required = self.required_replicas();
        let mut result = ReplicationResult::empty(bucket, filename, required);
        result.checksum = sha256_hex_offload(&data).await;

        let writes = self.nodes.iter().map(|node| {
            let data = data.clone();
            async move {
                let outcome = node.put(bucket, filename, data, content_type).await;
                (node, outcome)
            }
        });

        for (node, outcome) in join_all(writes).await {
            match outcome {
                Ok(()) => {
                    self.health.record_success(node.id());
                    result.replicated_nodes.push(node.id().to_string());
                }
                Err(e) => {
                    warn!(node = node.id(), error = %e, "replica write failed");
                    self.health.record_failure(node.id(), &e.to_string());
                    result.failed_nodes.push(node.id().to_string());
                }
            }
        }

        result.actual_replicas = result.replicated_nodes.len();
        result.success = result.actual_replicas >= required;
        result.elapsed = start.elapsed();
        REPLICATION_DURATION.observe(result.elapsed.as_secs_f64());

        if result.success {
            REPLICATIONS.with_label_values(&["durable"]).inc();
            info!(
                replicas = result.actual_replicas,
                required,
                checksum = %result.checksum,
                "replicated"
            );
        } else {
            REPLICATIONS.with_label_values(&["degraded"]).inc();
            let err = Error::InsufficientReplicas {
                got: result.actual_replicas,
                need: required,
            };
            warn!(failed = ?result.failed_nodes, error = %err, "replication below quorum");
            result.error = Some(err.to_string());
        }
        result
    }

    /// Read from healthy nodes in priority order, returning the first hit
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn read_file(&self, bucket: &str, filename: &str) -> Result<Bytes> {
        let healthy: Vec<&StorageNode> = self
            .nodes
            .iter()
            .filter(|n| self.health.is_healthy(n.id()))
            .collect();
        if healthy.is_empty() {
            return Err(Error::NoHealthyNodes);
        }

        let mut missing = 0;
        for node in &healthy {
            match node.get(bucket, filename).await {
                Ok(Some(obj)) => {
                    self.health.record_success(node.id());
                    debug!(node = node.id(), size = obj.data.len(), "read replica");
                    return Ok(obj.data);
                }
                Ok(None) => {
                    self.health.record_success(node.id());
                    debug!(node = node.id(), "replica missing");
                    missing += 1;
                }
                Err(e) => {
                    warn!(node = node.id(), error = %e, "replica read failed");
                    self.health.record_failure(node.id(), &e.to_string());
                }
            }
        }

        if missing == healthy.len() {
            return Err(Error::NotFound(format!("{}/{}", bucket, filename)));
        }
        Err(Error::AllReadsFailed {
            filename: filename.to_string(),
        })
    }

    /// Read and hash the object on every node.
    ///
    /// Unreadable nodes land in `failed_nodes` and are left out of the
    /// comparison. Any disagreement between readable replicas is reported as
    /// corruption; no value is picked.
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn verify_replication(&self, bucket: &str, filename: &str) -> ReplicationResult {
        let start = Instant::now();
        let required = self.required_replicas();
        let mut result = ReplicationResult::empty(bucket, filename, required);

        let reads = self.nodes.iter().map(|node| async move {
            (node, node.get(bucket, filename).await)
        });

        let mut checksums: Vec<(String, String)> = Vec::new();
        for (node, outcome) in join_all(reads).await {
            match outcome {
                Ok(Some(obj)) => {
                    self.health.record_success(node.id());
                    checksums.push((node.id().to_string(), sha256_hex_offload(&obj.data).await));
                    result.replicated_nodes.push(node.id().to_string());
                }
                Ok(None) => {
                    self.health.record_success(node.id());
                    result.failed_nodes.push(node.id().to_string());
                }
                Err(e) => {
                    warn!(node = node.id(), error = %e, "verify read failed");
                    self.health.record_failure(node.id(), &e.to_string());
                    result.failed_nodes.push(node.id().to_string());
                }
            }
        }

        let distinct: BTreeSet<&str> = checksums.iter().map(|(_, c)| c.as_str()).collect();
        result.actual_replicas = checksums.len();
        result.elapsed = start.elapsed();

        if distinct.len() > 1 {
            result.conflicting_checksums = distinct.iter().map(|c| c.to_string()).collect();
            let err = Error::ChecksumMismatch {
                filename: filename.to_string(),
                checksums: result.conflicting_checksums.clone(),
            };
            warn!(replicas = ?checksums, "replica checksums disagree");
            result.error = Some(err.to_string());
            return result;
        }

        if let Some(checksum) = distinct.into_iter().next() {
            result.checksum = checksum.to_string();
        }
        result.success = result.actual_replicas >= required;
        if !result.success {
            result.error = Some(
                Error::InsufficientReplicas {
                    got: result.actual_replicas,
                    need: required,
                }
                .to_string(),
            );
        }
        result
    }

    /// Delete the object from every node. Failures are reported, not raised.
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn delete_file(&self, bucket: &str, filename: &str) -> DeleteReport {
        let deletes = self.nodes.iter().map(|node| async move {
            (node, node.delete(bucket, filename).await)
        });

        let mut report = DeleteReport::default();
        for (node, outcome) in join_all(deletes).await {
            match outcome {
                Ok(true) => report.deleted_nodes.push(node.id().to_string()),
                Ok(false) => report.missing_nodes.push(node.id().to_string()),
                Err(e) => {
                    warn!(node = node.id(), error = %e, "replica delete failed");
                    self.health.record_failure(node.id(), &e.to_string());
                    report.failed_nodes.push(node.id().to_string());
                }
            }
        }
        report
    }
}

// =============================================================================
// Tests
// =============================================================================
