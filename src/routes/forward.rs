//! Tenant ingress: submit one operation for forwarding.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use super::error_response;
use crate::auth::TenantIdentity;
use crate::dispatch::SubmitOutcome;
use crate::queue::{Operation, Priority};
use crate::state::AppState;
use crate::util::now_ms;

fn default_timeout_ms() -> u64 {
    30_000
}

/// Request body for `POST /api/forward`.
#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    /// Opaque payload, base64-encoded.
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub priority: Priority,
    /// Absolute epoch-ms deadline; omitted means the operation never
    /// expires in the queue.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// `POST /api/forward` — authenticated tenant ingress.
///
/// Dispatches immediately when the link is up, buffers when it is down,
/// and surfaces rate-limit / queue-full / circuit-open rejections as
/// structured errors.
pub async fn forward(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(TenantIdentity(identity)): Extension<TenantIdentity>,
    Json(request): Json<ForwardRequest>,
) -> Response {
    let payload = match BASE64.decode(request.payload.as_bytes()) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("payload is not valid base64: {e}")})),
            )
                .into_response();
        }
    };

    let mut op = Operation::new(
        identity,
        request.priority,
        payload,
        request.headers,
        request.timeout_ms,
        request.deadline_ms,
    );
    op.correlation_id = request.correlation_id;
    let op_id = op.id.clone();

    let source = addr.ip().to_string();
    match state.dispatcher.submit(op, Some(&source)).await {
        Ok(SubmitOutcome::Dispatched(result)) => (
            StatusCode::OK,
            Json(json!({
                "status": "dispatched",
                "operation_id": op_id,
                "status_code": result.status_code,
                "payload": BASE64.encode(&result.payload),
                "headers": result.headers,
                "latency_ms": result.latency_ms,
            })),
        )
            .into_response(),
        Ok(SubmitOutcome::Queued { depth }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "queued",
                "operation_id": op_id,
                "queue_depth": depth,
                "queued_at_ms": now_ms(),
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}
