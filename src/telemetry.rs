//! Metrics and Logging
//!
//! Prometheus metric families shared by the cache and replication engines,
//! plus the tracing subscriber setup used by the binary.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge_vec, Histogram,
    IntCounterVec, IntGaugeVec,
};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// Metric Families
// =============================================================================

/// Cache lookups by tier (`l1`, `l2`, `l3`) and result (`hit`, `miss`, `error`)
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "depot_cache_lookups_total",
        "Cache lookups by tier and result",
        &["tier", "result"]
    )
    .expect("depot_cache_lookups_total registers once")
});

/// Cache writes by tier and result (`ok`, `failed`)
pub static CACHE_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "depot_cache_writes_total",
        "Cache tier writes by tier and result",
        &["tier", "result"]
    )
    .expect("depot_cache_writes_total registers once")
});

/// Promotions by source tier and result
pub static CACHE_PROMOTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "depot_cache_promotions_total",
        "Asynchronous promotions by source tier and result",
        &["from", "result"]
    )
    .expect("depot_cache_promotions_total registers once")
});

/// Replication calls by outcome (`durable`, `degraded`)
pub static REPLICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "depot_replications_total",
        "Replication calls by outcome",
        &["outcome"]
    )
    .expect("depot_replications_total registers once")
});

/// Wall-clock duration of replicated writes
pub static REPLICATION_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "depot_replication_duration_seconds",
        "Duration of fan-out replication writes"
    )
    .expect("depot_replication_duration_seconds registers once")
});

/// 1 when a node is healthy, 0 otherwise
pub static NODE_HEALTHY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "depot_node_healthy",
        "Storage node health (1 = healthy)",
        &["tenant", "node"]
    )
    .expect("depot_node_healthy registers once")
});

/// Background task outcomes by pool (`completed`, `failed`, `rejected`)
pub static TASKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "depot_tasks_total",
        "Background task outcomes by pool",
        &["pool", "outcome"]
    )
    .expect("depot_tasks_total registers once")
});

// =============================================================================
// Logging Setup
// =============================================================================

/// Parse a log level name, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global tracing subscriber
pub fn init_logging(level: &str, json: bool) {
    let mut filter = EnvFilter::from_default_env().add_directive(parse_level(level).into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_metric_families_register() {
        CACHE_LOOKUPS.with_label_values(&["l1", "hit"]).inc();
        let gauge = NODE_HEALTHY.with_label_values(&["telemetry", "n1"]);
        gauge.set(1);
        assert!(CACHE_LOOKUPS.with_label_values(&["l1", "hit"]).get() >= 1);
        assert_eq!(gauge.get(), 1);
    }
}
