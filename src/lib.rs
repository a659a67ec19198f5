//! Depot - Tiered Artifact Cache and Quorum Replication
//!
//! The storage core of a multi-tenant package registry: a three-tier
//! artifact cache sitting in front of quorum-replicated durable storage.
//!
//! # Architecture
//!
//! ```text
//! proxy / upload handlers
//!        │                         │
//!        ▼                         ▼
//! CacheManager               UnifiedReplicator
//!  L1 → L2 → L3               tenant → ReplicationEngine
//!        │                         │
//!        └──────────┬──────────────┘
//!                   ▼
//!              ObjectStore (local fs, S3/MinIO/GCS/Azure)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - L1/L2/L3 artifact cache with promotion
//! - [`checksum`] - SHA-256 content hash
//! - [`config`] - YAML configuration and default nodes
//! - [`error`] - Error types
//! - [`replication`] - Storage nodes, health, quorum replication
//! - [`storage`] - Object storage backends
//! - [`tasks`] - Bounded background task pool
//! - [`telemetry`] - Prometheus metrics and logging setup

pub mod cache;
pub mod checksum;
pub mod config;
pub mod error;
pub mod replication;
pub mod storage;
pub mod tasks;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{CacheKey, CacheManager, CacheTier, CachedArtifact};
pub use config::DepotConfig;
pub use error::{Error, Result};
pub use replication::{
    QuorumPolicy, ReplicationEngine, ReplicationRequest, ReplicationResult, UnifiedReplicator,
};
pub use tasks::{TaskHandle, TaskPool};
