//! REST route handlers for the management surface.

pub mod diagnostics;
pub mod forward;
pub mod health;
pub mod metrics;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::TunnelError;

/// Uniform error body: stable code, message, category, retryable flag.
pub fn error_response(err: &TunnelError) -> Response {
    let status = match err {
        TunnelError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        TunnelError::QueueFull { .. }
        | TunnelError::CircuitOpen { .. }
        | TunnelError::LimitExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        TunnelError::OperationExpired { .. } | TunnelError::Configuration(_) => {
            StatusCode::BAD_REQUEST
        }
        TunnelError::Authentication(_) => StatusCode::UNAUTHORIZED,
        TunnelError::FrameTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        TunnelError::Network(_)
        | TunnelError::ReconnectExhausted { .. }
        | TunnelError::Cancelled => StatusCode::BAD_GATEWAY,
        TunnelError::Server(_) | TunnelError::Protocol(_) | TunnelError::Unknown(_) => {
            StatusCode::BAD_GATEWAY
        }
    };

    let mut body = json!({
        "error": err.to_string(),
        "code": err.code(),
        "category": err.category().as_str(),
        "retryable": err.retryable(),
    });
    if let TunnelError::RateLimited { retry_after, .. } = err {
        body["retry_after_secs"] = json!(retry_after);
    }

    (status, Json(body)).into_response()
}
