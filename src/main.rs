//! Depot
//!
//! Runs the artifact cache and replication services and exposes an admin
//! endpoint for health, readiness, metrics and per-tenant replication status.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          depot                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CacheManager (L1/L2/L3)     UnifiedReplicator (tenants)    │
//! │              └──────── admin server ────────┘               │
//! │      /healthz  /readyz  /metrics  /replication/<tenant>     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use depot::cache::{CacheManager, MemoryL1Store};
use depot::config::DepotConfig;
use depot::replication::{StaticNodeSource, UnifiedReplicator};
use depot::telemetry::init_logging;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Depot - tiered artifact cache and quorum replication
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "DEPOT_CONFIG")]
    config: Option<PathBuf>,

    /// L2 cache directory (overrides the config file)
    #[arg(long, env = "DEPOT_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Admin server bind address
    #[arg(long, env = "DEPOT_ADMIN_ADDR", default_value = "0.0.0.0:9090")]
    admin_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

struct AppState {
    cache: CacheManager,
    replicator: Arc<UnifiedReplicator>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    info!("Starting depot");

    let mut config = match &args.config {
        Some(path) => DepotConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => DepotConfig::default(),
    };
    if let Some(dir) = args.cache_dir {
        config.cache.l2_dir = dir;
    }

    let cache_config = config
        .cache
        .to_cache_config()
        .context("invalid cache configuration")?;
    let cold = config
        .cache
        .build_cold_store()
        .context("building L3 cold store")?;
    info!(
        l2_dir = %cache_config.l2.cache_dir.display(),
        l3 = %cold.as_ref().map(|c| c.describe()).unwrap_or_else(|| "disabled".to_string()),
        "cache configured"
    );
    let cache = CacheManager::new(
        cache_config,
        Arc::new(MemoryL1Store::with_config(config.cache.l1_config())),
        cold,
    );

    let source = Arc::new(StaticNodeSource::new(config.tenants.clone()));
    let replicator = Arc::new(UnifiedReplicator::new(source, config.replication.clone()));
    info!(
        tenants = config.tenants.len(),
        quorum = %config.replication.quorum,
        "replication configured"
    );

    let state = Arc::new(AppState { cache, replicator });

    let admin_addr: SocketAddr = args
        .admin_addr
        .parse()
        .with_context(|| format!("invalid admin address {}", args.admin_addr))?;
    let listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding admin server to {}", admin_addr))?;
    info!("Admin server listening on {}", admin_addr);

    tokio::select! {
        result = run_admin_server(listener, Arc::clone(&state)) => {
            result.context("admin server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    state.cache.drain_promotions().await;
    let dropped = state.replicator.invalidate_all_caches().await;
    info!(engines = dropped, "depot shutdown complete");
    Ok(())
}

// =============================================================================
// Admin Server
// =============================================================================

async fn run_admin_server(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| admin_handler(Arc::clone(&state), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Admin server connection error: {}", e);
            }
        });
    }
}

async fn admin_handler(
    state: Arc<AppState>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let response = match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => match state.cache.get_cache_stats().await {
            Ok(_) => text(StatusCode::OK, "ok"),
            Err(e) => {
                warn!(error = %e, "readiness check failed");
                text(StatusCode::SERVICE_UNAVAILABLE, "cache unavailable")
            }
        },
        "/metrics" => metrics(),
        "/cache/stats" => match state.cache.get_cache_stats().await {
            Ok(stats) => json(StatusCode::OK, &stats),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        _ => match path.strip_prefix("/replication/") {
            Some(raw) if !raw.is_empty() => replication_status(&state, raw).await,
            _ => text(StatusCode::NOT_FOUND, "not found"),
        },
    };
    Ok(response)
}

async fn replication_status(state: &AppState, raw_tenant: &str) -> Response<Full<Bytes>> {
    let tenant = match urlencoding::decode(raw_tenant) {
        Ok(t) => t.into_owned(),
        Err(_) => return text(StatusCode::BAD_REQUEST, "invalid tenant id"),
    };
    match state.replicator.get_replication_status(&tenant).await {
        Ok(status) => json(StatusCode::OK, &status),
        Err(e) => {
            warn!(tenant = %tenant, error = %e, "replication status unavailable");
            text(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

fn metrics() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }
    respond(StatusCode::OK, encoder.format_type(), buffer)
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", body.as_bytes().to_vec())
}

fn respond(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}
