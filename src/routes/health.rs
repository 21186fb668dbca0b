//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::util::now_ms;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and per-subsystem checks. `200` when
/// every check passes, `503` otherwise — suitable for load-balancer
/// probes. No authentication required.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let uptime = state.start_time.elapsed().as_secs();
    let stats = &state.link_stats;

    let connected = stats.connected.load(Ordering::Relaxed);
    let link_configured = state.config.tunnel.url.is_some();
    let link_ok = connected || !link_configured;

    let depths = state.dispatcher.queue().depths();
    let capacity = state.config.queue.capacity;
    let saturated: Vec<&String> = depths
        .iter()
        .filter(|(_, depth)| **depth >= capacity)
        .map(|(identity, _)| identity)
        .collect();
    let queue_ok = saturated.is_empty();

    let breakers = state.dispatcher.breaker_snapshots();
    let open_breakers = breakers
        .values()
        .filter(|snapshot| snapshot.state == crate::breaker::CircuitState::Open)
        .count();
    let breakers_ok = breakers.is_empty() || open_breakers < breakers.len();

    let last_pong_ms = stats.last_pong_ms.load(Ordering::Relaxed);
    let last_pong_age_ms = if last_pong_ms == 0 {
        None
    } else {
        Some(now_ms().saturating_sub(last_pong_ms))
    };
    let (rtt_median, rtt_p95) = stats.rtt_stats().unwrap_or((0, 0));

    let healthy = link_ok && queue_ok && breakers_ok;
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "link": {
                "ok": link_ok,
                "configured": link_configured,
                "connected": connected,
                "state": state.reconnect.state().as_str(),
                "reconnects": stats.reconnects.load(Ordering::Relaxed),
                "last_pong_age_ms": last_pong_age_ms,
                "rtt_median_ms": rtt_median,
                "rtt_p95_ms": rtt_p95,
            },
            "queue": {
                "ok": queue_ok,
                "identities": depths.len(),
                "saturated": saturated,
            },
            "breakers": {
                "ok": breakers_ok,
                "total": breakers.len(),
                "open": open_breakers,
            },
        },
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
