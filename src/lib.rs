#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! rtun library — the resilience and flow-control core behind the gateway
//! binary, exposed for downstream embedding.
//!
//! Key building blocks:
//! - `tunnel` — link supervisor, reconnect state machine, heartbeat, frames
//! - `dispatch` — admission path: limiter → breaker → pool → session
//! - `queue` — per-tenant priority queue with durable high-priority mirrors
//! - `pool` — per-identity backend session pool with channel caps
//! - `limiter` — tiered token buckets
//! - `breaker` — circuit breaker per protected call path
//! - `auth` — pre-shared token middleware
//! - `config` — configuration loading
//! - `routes` — management surface handlers

pub mod auth;
pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use breaker::{CircuitBreaker, CircuitState};
pub use config::Config;
pub use dispatch::{Dispatcher, SubmitOutcome};
pub use error::{ErrorCategory, TunnelError};
pub use limiter::RateLimiter;
pub use pool::ConnectionPool;
pub use queue::{Operation, Priority, RequestQueue};
pub use state::AppState;
pub use tunnel::reconnect::{LinkState, ReconnectionManager};
