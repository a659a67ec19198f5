//! Quorum Replication
//!
//! ```text
//! UnifiedReplicator (tenant → engine, double-checked RwLock)
//!        │
//!        ▼
//! ReplicationEngine ──fan-out──▶ StorageNode × N ──▶ ObjectStore
//!        │                              ▲
//!        └── NodeHealthTracker ◀── NodeHealthMonitor (periodic probes)
//! ```
//!
//! A write is durable once `QuorumPolicy::required(n)` nodes accept it.
//! Reads use healthy nodes in priority order; there is no read repair.

mod engine;
mod health;
mod node;
mod unified;

pub use engine::{DeleteReport, ReplicationEngine, ReplicationResult};
pub use health::{
    MonitorHandle, NodeHealth, NodeHealthMonitor, NodeHealthTracker, DEFAULT_CHECK_INTERVAL,
    FAILURE_THRESHOLD,
};
pub use node::{
    build_nodes, Credentials, NodeConfig, NodeRow, NodeType, QuorumPolicy, RemoteBucket,
    StorageNode,
};
pub use unified::{
    NodeConfigSource, NodeStatus, ReplicationRequest, ReplicationSettings, ReplicationStatus,
    StaticNodeSource, UnifiedReplicator,
};
