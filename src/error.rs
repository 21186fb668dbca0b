//! Error taxonomy shared across the core.
//!
//! Every error carries a stable machine code, a category that decides how
//! callers react (retry, reconnect, re-auth, fail fast), and a retryable
//! flag, so handling stays uniform across the ingress, the queue, and the
//! dispatch path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse error classes. The category, not the concrete variant, decides
/// retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Refused / DNS / timeout — retryable, drives reconnection.
    Network,
    /// Invalid or expired credential — surfaced for re-auth, never auto-retried.
    Authentication,
    /// Invalid settings — fails fast, never retried.
    Configuration,
    /// Backend unavailable or overloaded — routed through the circuit breaker.
    Server,
    /// Framing or handshake mismatch.
    Protocol,
    /// Catch-all, surfaced with context, not retried.
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::Server => "server",
            Self::Protocol => "protocol",
            Self::Unknown => "unknown",
        }
    }
}

/// Errors produced by the tunnel core.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("backend error: {0}")]
    Server(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("queue full for {identity} (capacity {capacity})")]
    QueueFull { identity: String, capacity: usize },

    #[error("operation {id} expired before dispatch")]
    OperationExpired { id: String },

    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("rate limit exceeded for {identity}, retry after {retry_after:.1}s")]
    RateLimited { identity: String, retry_after: f64 },

    #[error("session limit reached for {identity} (max {max_sessions})")]
    LimitExceeded {
        identity: String,
        max_sessions: usize,
    },

    #[error("frame of {size} bytes exceeds ceiling of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("reconnect cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

impl TunnelError {
    /// Stable machine-readable code, safe to match on across versions.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "NETWORK",
            Self::Authentication(_) => "AUTH",
            Self::Configuration(_) => "CONFIG",
            Self::Server(_) => "SERVER",
            Self::Protocol(_) => "PROTOCOL",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::OperationExpired { .. } => "EXPIRED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::LimitExceeded { .. } => "SESSION_LIMIT",
            Self::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            Self::ReconnectExhausted { .. } => "RECONNECT_EXHAUSTED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(_) | Self::ReconnectExhausted { .. } | Self::Cancelled => {
                ErrorCategory::Network
            }
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Server(_) | Self::CircuitOpen { .. } | Self::LimitExceeded { .. } => {
                ErrorCategory::Server
            }
            Self::Protocol(_) | Self::FrameTooLarge { .. } => ErrorCategory::Protocol,
            Self::QueueFull { .. } | Self::OperationExpired { .. } | Self::RateLimited { .. } => {
                ErrorCategory::Server
            }
            Self::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether the caller may retry the same operation without changing it.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::Server(_)
            | Self::CircuitOpen { .. }
            | Self::RateLimited { .. }
            | Self::QueueFull { .. }
            | Self::LimitExceeded { .. } => true,
            Self::Authentication(_)
            | Self::Configuration(_)
            | Self::Protocol(_)
            | Self::OperationExpired { .. }
            | Self::FrameTooLarge { .. }
            | Self::ReconnectExhausted { .. }
            | Self::Cancelled
            | Self::Unknown(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(TunnelError::Network("refused".into()).code(), "NETWORK");
        assert_eq!(
            TunnelError::QueueFull {
                identity: "acme".into(),
                capacity: 100
            }
            .code(),
            "QUEUE_FULL"
        );
        assert_eq!(TunnelError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn network_errors_are_retryable() {
        assert!(TunnelError::Network("timeout".into()).retryable());
        assert!(!TunnelError::Authentication("expired".into()).retryable());
        assert!(!TunnelError::Configuration("bad listen addr".into()).retryable());
    }

    #[test]
    fn categories_match_taxonomy() {
        assert_eq!(
            TunnelError::Protocol("bad tag".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            TunnelError::CircuitOpen {
                retry_in: Duration::from_secs(1)
            }
            .category(),
            ErrorCategory::Server
        );
    }
}
