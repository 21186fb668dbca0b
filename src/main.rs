#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # rtun
//!
//! Resilient multi-tenant forwarding gateway. rtun accepts tenant
//! operations over an authenticated HTTP ingress and forwards them across
//! a persistent WebSocket link to a backend relay, keeping the logical
//! session alive through transport failures and protecting the backend
//! from overload.
//!
//! ## API surface
//!
//! | Method | Path               | Auth         | Description                       |
//! |--------|--------------------|--------------|-----------------------------------|
//! | GET    | `/api/health`      | No           | Liveness probe with checks        |
//! | GET    | `/api/metrics`     | No           | Prometheus scrape endpoint        |
//! | GET    | `/api/diagnostics` | admin key    | Pool/queue/breaker/limiter dump   |
//! | POST   | `/api/reconnect`   | admin key    | Re-arm a failed link              |
//! | POST   | `/api/forward`     | tenant token | Submit one operation              |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs          — bearer token middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! dispatch.rs      — limiter → breaker → pool → session path, queue flush
//! limiter.rs       — tiered per-identity token buckets
//! breaker.rs       — circuit breaker per protected call path
//! queue/
//!   mod.rs         — per-tenant priority queue, backpressure, expiry
//!   store.rs       — JSONL mirror for high-priority operations
//! pool/
//!   mod.rs         — per-identity session sets, caps, idle eviction
//!   session.rs     — BackendSession + transport traits
//! tunnel/
//!   mod.rs         — link supervisor, WS transport, frame correlation
//!   frame.rs       — tagged wire frames, size ceiling
//!   reconnect.rs   — link state machine, backoff + jitter
//!   heartbeat.rs   — ping/pong liveness probing
//! routes/          — health, metrics, diagnostics, forward handlers
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use rtun::auth::{self, AuthKeys};
use rtun::config::Config;
use rtun::dispatch::Dispatcher;
use rtun::queue::store::{JsonlStore, OperationStore};
use rtun::queue::QueueEvent;
use rtun::routes;
use rtun::state::{AppState, LinkStats};
use rtun::tunnel::{self, reconnect::ReconnectionManager, LinkShared, WsConnector};

/// Resilient multi-tenant forwarding gateway.
#[derive(Parser)]
#[command(name = "rtun", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("rtun v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.admin_key == "change-me" {
        warn!("Using default admin key — set RTUN_ADMIN_KEY or update config");
    }
    if config.auth.tenants.is_empty() {
        warn!("No tenant tokens configured, /api/forward will reject everything");
    }

    let metrics_handle = rtun::metrics::init();
    let config = Arc::new(config);

    // Durable mirror for high-priority operations.
    let store: Option<Arc<dyn OperationStore>> =
        match JsonlStore::open(&Path::new(&config.server.data_dir).join("queue")) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("Durable queue store unavailable, running without it: {e}");
                None
            }
        };

    let link_stats = Arc::new(LinkStats::new());
    let link_shared = Arc::new(LinkShared::new());
    let connector = Arc::new(WsConnector::new(
        Arc::clone(&link_shared),
        config.tunnel.max_frame_bytes,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        connector,
        store,
        Arc::clone(&link_stats),
    ));

    // Crash recovery: reload high-priority mirrors from a prior run.
    match dispatcher.restore_persisted() {
        Ok(0) => {}
        Ok(restored) => info!("Restored {restored} persisted operation(s)"),
        Err(e) => warn!("Persisted operation restore failed: {e}"),
    }

    let reconnect = Arc::new(ReconnectionManager::new((&config.tunnel).into()));
    let shutdown = CancellationToken::new();

    let state = AppState {
        config: Arc::clone(&config),
        start_time: Instant::now(),
        dispatcher: Arc::clone(&dispatcher),
        reconnect: Arc::clone(&reconnect),
        link_stats: Arc::clone(&link_stats),
        metrics: metrics_handle,
    };

    // Build router
    let auth_keys = AuthKeys {
        admin_key: config.auth.admin_key.clone(),
        tenants: Arc::new(config.auth.tenants.clone()),
    };

    // Bare paths are aliases for scrapers and load balancers that expect
    // the conventional locations.
    let public_routes = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/health", get(routes::health::health))
        .route("/api/metrics", get(routes::metrics::metrics))
        .route("/metrics", get(routes::metrics::metrics));

    let tenant_routes = Router::new()
        .route("/api/forward", post(routes::forward::forward))
        .layer(middleware::from_fn(auth::require_tenant_token));

    let admin_routes = Router::new()
        .route("/api/diagnostics", get(routes::diagnostics::diagnostics))
        .route("/diagnostics", get(routes::diagnostics::diagnostics))
        .route("/api/reconnect", post(routes::diagnostics::reconnect))
        .layer(middleware::from_fn(auth::require_admin_key));

    let app = Router::new()
        .merge(public_routes)
        .merge(tenant_routes)
        .merge(admin_routes)
        .layer(Extension(auth_keys))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Gateway ready");

    // Tunnel link supervisor
    let _link_task = tunnel::spawn(
        Arc::clone(&dispatcher),
        Arc::clone(&reconnect),
        Arc::clone(&link_stats),
        link_shared,
        config.tunnel.clone(),
        shutdown.clone(),
    );

    // Periodic sweep: evict idle sessions and rate buckets.
    let sweep_dispatcher = Arc::clone(&dispatcher);
    let sweep_interval = config.pool.sweep_interval_secs;
    let sweep_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            sweep_dispatcher.sweep().await;
        }
    });

    // Forward queue events to the log sink.
    let mut queue_events = dispatcher.queue().subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = queue_events.recv().await {
            match event {
                QueueEvent::Backpressure {
                    identity,
                    fill,
                    should_throttle,
                } => {
                    if should_throttle {
                        warn!(identity = %identity, fill, "Backpressure: producers should slow down");
                    } else {
                        info!(identity = %identity, fill, "Backpressure released");
                    }
                }
                QueueEvent::Expired { identity, id } => {
                    warn!(identity = %identity, op_id = %id, "Queued operation expired");
                }
            }
        }
    });

    // Graceful shutdown
    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("Failed to register SIGTERM");
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
            shutdown.cancel();
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    shutdown.cancel();
    sweep_task.abort();
    event_task.abort();
    info!("Goodbye");
}
