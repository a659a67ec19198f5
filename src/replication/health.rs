//! Node Health
//!
//! [`NodeHealthTracker`] holds the per-node state machine:
//!
//! ```text
//! Healthy --(3 consecutive failures)--> Unhealthy
//! Unhealthy --(1 success)--> Healthy
//! ```
//!
//! Write/read outcomes and periodic probes from [`NodeHealthMonitor`] both
//! feed it. Status queries always get a copy of the map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::node::StorageNode;
use crate::telemetry::NODE_HEALTHY;

/// Consecutive failures before a node is marked unhealthy
pub const FAILURE_THRESHOLD: u32 = 3;

/// Default probe interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Health of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_check: None,
            failure_count: 0,
        }
    }
}

/// Per-node health state for one tenant's nodes
pub struct NodeHealthTracker {
    tenant: String,
    nodes: RwLock<HashMap<String, NodeHealth>>,
}

impl NodeHealthTracker {
    /// Start every node healthy
    pub fn new<I, S>(tenant: impl Into<String>, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tenant = tenant.into();
        let nodes: HashMap<String, NodeHealth> = node_ids
            .into_iter()
            .map(|id| (id.into(), NodeHealth::default()))
            .collect();
        for id in nodes.keys() {
            NODE_HEALTHY
                .with_label_values(&[tenant.as_str(), id.as_str()])
                .set(1);
        }
        Self {
            tenant,
            nodes: RwLock::new(nodes),
        }
    }

    /// Record a successful probe or operation
    pub fn record_success(&self, node_id: &str) {
        let recovered = {
            let mut nodes = self.nodes.write();
            let health = nodes.entry(node_id.to_string()).or_default();
            let recovered = !health.is_healthy;
            health.is_healthy = true;
            health.failure_count = 0;
            health.last_check = Some(Utc::now());
            recovered
        };

        if recovered {
            info!(tenant = %self.tenant, node = node_id, "node recovered");
        }
        self.publish(node_id, true);
    }

    /// Record a failed probe or operation
    pub fn record_failure(&self, node_id: &str, reason: &str) {
        let (tripped, failures, healthy) = {
            let mut nodes = self.nodes.write();
            let health = nodes.entry(node_id.to_string()).or_default();
            health.failure_count = health.failure_count.saturating_add(1);
            health.last_check = Some(Utc::now());
            let tripped = health.is_healthy && health.failure_count >= FAILURE_THRESHOLD;
            if tripped {
                health.is_healthy = false;
            }
            (tripped, health.failure_count, health.is_healthy)
        };

        if tripped {
            warn!(
                tenant = %self.tenant,
                node = node_id,
                failures,
                reason,
                "node marked unhealthy"
            );
        } else {
            debug!(tenant = %self.tenant, node = node_id, failures, reason, "node failure");
        }
        self.publish(node_id, healthy);
    }

    // Set on every record so a series removed by a replaced tracker comes back
    fn publish(&self, node_id: &str, healthy: bool) {
        NODE_HEALTHY
            .with_label_values(&[self.tenant.as_str(), node_id])
            .set(i64::from(healthy));
    }

    /// Unknown nodes count as healthy
    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.nodes
            .read()
            .get(node_id)
            .map(|h| h.is_healthy)
            .unwrap_or(true)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeHealth> {
        self.nodes.read().get(node_id).copied()
    }

    /// Point-in-time copy of every node's health
    pub fn snapshot(&self) -> HashMap<String, NodeHealth> {
        self.nodes.read().clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.read().values().filter(|h| h.is_healthy).count()
    }
}

impl Drop for NodeHealthTracker {
    fn drop(&mut self) {
        for id in self.nodes.get_mut().keys() {
            // Absent series were never published or are already gone
            let _ = NODE_HEALTHY.remove_label_values(&[self.tenant.as_str(), id.as_str()]);
        }
    }
}

/// Periodic prober for a set of nodes
#[derive(Clone)]
pub struct NodeHealthMonitor {
    nodes: Arc<[StorageNode]>,
    tracker: Arc<NodeHealthTracker>,
    bucket: String,
    probe_timeout: Duration,
}

impl NodeHealthMonitor {
    /// `bucket` is probed on nodes without a fixed bucket
    pub fn new(
        nodes: Arc<[StorageNode]>,
        tracker: Arc<NodeHealthTracker>,
        bucket: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            nodes,
            tracker,
            bucket: bucket.into(),
            probe_timeout,
        }
    }

    /// Probe every node once, concurrently, and record the outcomes.
    /// Returns node id → probe succeeded.
    pub async fn check_now(&self) -> HashMap<String, bool> {
        let probes = self.nodes.iter().map(|node| async move {
            let outcome = tokio::time::timeout(self.probe_timeout, node.probe(&self.bucket)).await;
            match outcome {
                Ok(Ok(())) => {
                    self.tracker.record_success(node.id());
                    (node.id().to_string(), true)
                }
                Ok(Err(e)) => {
                    self.tracker.record_failure(node.id(), &e.to_string());
                    (node.id().to_string(), false)
                }
                Err(_) => {
                    self.tracker.record_failure(
                        node.id(),
                        &format!("probe timed out after {:?}", self.probe_timeout),
                    );
                    (node.id().to_string(), false)
                }
            }
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Probe on a fixed interval until the handle is stopped or dropped.
    /// A tick that is still running when the next one is due skips it.
    pub fn spawn(self, interval: Duration) -> MonitorHandle {
        let token = CancellationToken::new();
        let child = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(tenant = %self.tracker.tenant, nodes = self.nodes.len(), ?interval, "health monitor started");

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let results = self.check_now().await;
                        let healthy = results.values().filter(|ok| **ok).count();
                        debug!(tenant = %self.tracker.tenant, healthy, total = results.len(), "health check round");
                    }
                }
            }
            debug!(tenant = %self.tracker.tenant, "health monitor stopped");
        });

        MonitorHandle {
            token,
            task: Some(task),
        }
    }
}

/// Handle to a running monitor; dropping it stops the monitor
pub struct MonitorHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal the monitor to stop
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop and wait for the monitor task to exit
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
