//! Privileged internals snapshot for troubleshooting.

use std::sync::atomic::Ordering;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::state::AppState;
use crate::tunnel::reconnect::LinkState;

/// `GET /api/diagnostics` — admin-key protected dump of pool, queue,
/// breaker, and limiter internals plus the link's recent event history.
pub async fn diagnostics(State(state): State<AppState>) -> Json<Value> {
    let stats = &state.link_stats;
    let (rtt_median, rtt_p95) = stats.rtt_stats().unwrap_or((0, 0));

    Json(json!({
        "link": {
            "state": state.reconnect.state().as_str(),
            "attempts": state.reconnect.attempts(),
            "seconds_since_activity": state.reconnect.seconds_since_activity(),
            "connected": stats.connected.load(Ordering::Relaxed),
            "reconnects": stats.reconnects.load(Ordering::Relaxed),
            "frames_sent": stats.frames_sent.load(Ordering::Relaxed),
            "frames_received": stats.frames_received.load(Ordering::Relaxed),
            "dropped_outbound": stats.dropped_outbound.load(Ordering::Relaxed),
            "rtt_median_ms": rtt_median,
            "rtt_p95_ms": rtt_p95,
            "recent_events": state.reconnect.recent_events(10),
        },
        "queue": {
            "capacity": state.config.queue.capacity,
            "depths": state.dispatcher.queue().depths(),
        },
        "breakers": state.dispatcher.breaker_snapshots(),
        "limiter": {
            "buckets": state.dispatcher.limiter().bucket_count(),
        },
        "pool": {
            "sessions": state.dispatcher.pool().session_count().await,
            "identities": state.dispatcher.pool().identity_count().await,
            "by_identity": state.dispatcher.pool().snapshot().await,
        },
    }))
}

/// `POST /api/reconnect` — admin-key protected re-arm of a failed link.
///
/// A link that exhausted its reconnect budget stays Failed until this is
/// called; the supervisor picks the re-armed link up on its next poll.
pub async fn reconnect(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let before = state.reconnect.state();
    if before != LinkState::Failed {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "link is not failed",
                "state": before.as_str(),
            })),
        );
    }

    state.reconnect.reset();
    info!("Link re-armed by operator");
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "rearmed", "state": state.reconnect.state().as_str()})),
    )
}
