//! Layer-4 TCP Load Balancer
//!
//! Main entry point for the proxy.
//! Responsibilities:
//! 1. Parse CLI arguments to load configuration.
//! 2. Build the backend pool, balancer, health checker and discovery bridge.
//! 3. Run the public TCP listener and the admin HTTP API.
//! 4. Handle graceful and forced shutdown on `Ctrl+C` or `SIGTERM`.

use std::error::Error;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router, Server,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::init;

use strait::backend::{BalancerError, Backend};
use strait::config::{try_load_config, DiscoveryKind};
use strait::discovery::{Discover, Registry, StaticDiscovery, EVENT_CHANNEL_CAPACITY};
use strait::health;
use strait::pool::Pool;
use strait::proxy::Proxy;
use strait::shutdown::ShutdownManager;
use strait::strategy;

/// How long `stop` waits for in-flight connections before abandoning them.
const PROXY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long background tasks get to wind down on a graceful exit.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line interface for the application.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Serialize)]
struct BackendStatus {
    address: String,
    weight: i64,
    alive: bool,
    conn_count: i64,
}

impl From<&Arc<Backend>> for BackendStatus {
    fn from(b: &Arc<Backend>) -> Self {
        Self {
            address: b.address().to_string(),
            weight: b.weight(),
            alive: b.is_alive(),
            conn_count: b.conn_count(),
        }
    }
}

#[derive(Deserialize)]
struct AddBackendRequest {
    address: String,
    #[serde(default)]
    weight: Option<i64>,
}

#[derive(Deserialize)]
struct UpdateWeightRequest {
    weight: i64,
}

/// Simple health check endpoint for monitoring services.
async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

/// Lists every pool backend with its live state.
async fn handle_list_backends(State(pool): State<Arc<Pool>>) -> impl IntoResponse {
    let backends: Vec<BackendStatus> = pool.all().iter().map(BackendStatus::from).collect();
    Json(backends)
}

/// Registers a backend by hand; 409 when the address is already present.
async fn handle_add_backend(
    State(pool): State<Arc<Pool>>,
    Json(req): Json<AddBackendRequest>,
) -> Response {
    match pool.add(&req.address, req.weight.unwrap_or(1)) {
        Ok(backend) => {
            info!(address = %req.address, "Backend added via admin API");
            (StatusCode::CREATED, Json(BackendStatus::from(&backend))).into_response()
        }
        Err(e @ BalancerError::DuplicateBackend(_)) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_get_backend(
    State(pool): State<Arc<Pool>>,
    Path(address): Path<String>,
) -> Response {
    match pool.get(&address) {
        Ok(backend) => Json(BackendStatus::from(&backend)).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn handle_update_weight(
    State(pool): State<Arc<Pool>>,
    Path(address): Path<String>,
    Json(req): Json<UpdateWeightRequest>,
) -> Response {
    match pool.update_weight(&address, req.weight) {
        Ok(()) => {
            info!(address = %address, weight = req.weight, "Backend weight updated");
            StatusCode::OK.into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn handle_remove_backend(
    State(pool): State<Arc<Pool>>,
    Path(address): Path<String>,
) -> Response {
    if pool.remove(&address) {
        info!(address = %address, "Backend removed via admin API");
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, format!("backend not found: {address}")).into_response()
    }
}

/// Exposes Prometheus metrics.
async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                format!("Error encoding metrics: {}", e).into_bytes(),
            )
        }
    }
}

fn admin_router(pool: Arc<Pool>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/backends", get(handle_list_backends).post(handle_add_backend))
        .route(
            "/backends/:address",
            get(handle_get_backend).put(handle_update_weight).delete(handle_remove_backend),
        )
        .route("/metrics", get(metrics_handler))
        .with_state(pool)
}

/// Main entry point: wire everything up, serve, and unwind on signal.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init();

    let args = Cli::parse();
    let cfg = try_load_config(&args.config)?;

    let pool = Arc::new(Pool::new());
    let balancer = strategy::build(cfg.algorithm, Arc::clone(&pool));
    let mut shutdown_manager = ShutdownManager::new();

    // Health checking covers every backend the pool ever holds, discovered
    // or configured.
    {
        let pool = Arc::clone(&pool);
        let health_cfg = cfg.health_check;
        let shutdown_rx = shutdown_manager.subscribe();
        shutdown_manager
            .spawn_task(health::health_check_loop(pool, health_cfg, shutdown_rx));
    }

    match cfg.discovery.kind {
        DiscoveryKind::Static => {
            info!("Using static discovery");
            let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

            let registry = Registry::new(Arc::clone(&pool));
            let applier_rx = shutdown_manager.subscribe();
            shutdown_manager
                .spawn_task(async move { registry.run(events_rx, applier_rx).await });

            let source = StaticDiscovery::new(cfg.backends.clone());
            let source_rx = shutdown_manager.subscribe();
            shutdown_manager.spawn_task(async move {
                if let Err(e) = source.run(events_tx, source_rx).await {
                    error!(error = %e, "Static discovery failed");
                }
            });
        }
        kind @ (DiscoveryKind::Docker | DiscoveryKind::Kubernetes) => {
            // Runtime discovery sources live outside this binary; they feed
            // the same event channel through the Discover trait. Until one is
            // attached, the configured backends are the pool.
            warn!(kind = ?kind, "Discovery source not built in, using configured backends");
            for b in &cfg.backends {
                if let Err(e) = pool.add(&b.address, b.weight) {
                    error!(address = %b.address, error = %e, "Failed to add initial backend");
                }
            }
        }
    }

    let proxy = Arc::new(
        Proxy::bind(&cfg.listen_address, balancer, cfg.timeout).await?,
    );
    info!(addr = %proxy.local_addr(), algorithm = ?cfg.algorithm, "Starting proxy");
    let proxy_task = tokio::spawn(Arc::clone(&proxy).run());

    let app = admin_router(Arc::clone(&pool));
    let admin_addr = cfg.admin_address.parse()?;
    let server = Server::bind(&admin_addr).serve(app.into_make_service());
    info!(addr = %admin_addr, "Admin API listening");

    let force_shutdown_atomic = Arc::new(AtomicBool::new(false));
    let force_shutdown_clone = Arc::clone(&force_shutdown_atomic);

    let graceful = server.with_graceful_shutdown(async move {
        let force = shutdown_signal().await;
        if force {
            force_shutdown_clone.store(true, Ordering::Relaxed);
        }
        info!(
            "Received shutdown signal, initiating {} shutdown...",
            if force { "forced" } else { "graceful" }
        );
    });

    if let Err(e) = graceful.await {
        error!(error = %e, "Admin server error");
    }

    let force_shutdown = force_shutdown_atomic.load(Ordering::Relaxed);

    // Admin is down; drain the data plane, then the background tasks.
    match proxy.stop(PROXY_DRAIN_TIMEOUT).await {
        Ok(()) => info!("Proxy drained cleanly"),
        Err(e) => error!(error = %e, "Proxy drain incomplete"),
    }
    let _ = proxy_task.await;

    if force_shutdown {
        info!("Forcing shutdown of background tasks.");
        shutdown_manager.abort_all();
    } else if let Err(e) = shutdown_manager.graceful_shutdown(TASK_SHUTDOWN_TIMEOUT).await {
        error!(error = %e, "Graceful shutdown failed");
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Listens for shutdown signals.
/// Returns `true` if forced shutdown is required, `false` otherwise.
async fn shutdown_signal() -> bool {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received. Starting graceful shutdown. Press Ctrl+C again within 10s to force.");
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Second Ctrl+C received - forcing immediate shutdown.");
                    true
                },
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    false
                }
            }
        },
        _ = terminate => {
            info!("SIGTERM received. Starting graceful shutdown.");
            false
        },
    }
}
