//! Pre-shared token authentication.
//!
//! Two surfaces, two middlewares: `/api/forward` takes a tenant bearer
//! token that resolves to an identity, `/api/diagnostics` takes the admin
//! key. Token issuance is external — this module only checks validity and
//! maps token → identity, in constant time.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Keys injected into the router layer so the middlewares can run without
/// touching `AppState`.
#[derive(Clone)]
pub struct AuthKeys {
    pub admin_key: String,
    /// Tenant bearer token → identity.
    pub tenants: Arc<HashMap<String, String>>,
}

/// Identity resolved from a tenant token, attached as a request extension.
#[derive(Clone)]
pub struct TenantIdentity(pub String);

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Missing or invalid Authorization header"})),
    )
        .into_response()
}

/// Reject requests without the admin key.
pub async fn require_admin_key(request: Request, next: Next) -> Response {
    let Some(keys) = request.extensions().get::<AuthKeys>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let Some(provided) = bearer_token(&request) else {
        return unauthorized();
    };

    if !constant_time_eq(keys.admin_key.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid admin key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Resolve a tenant token to its identity, or reject the request.
///
/// Every configured token is compared in constant time so response timing
/// leaks neither key material nor which tenant was close.
pub async fn require_tenant_token(mut request: Request, next: Next) -> Response {
    let Some(keys) = request.extensions().get::<AuthKeys>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let Some(provided) = bearer_token(&request) else {
        return unauthorized();
    };

    let mut matched: Option<String> = None;
    for (token, identity) in keys.tenants.iter() {
        if constant_time_eq(token.as_bytes(), provided.as_bytes()) {
            matched = Some(identity.clone());
        }
    }

    match matched {
        Some(identity) => {
            request.extensions_mut().insert(TenantIdentity(identity));
            next.run(request).await
        }
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Unknown tenant token"})),
        )
            .into_response(),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot determine key length from
/// response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}
