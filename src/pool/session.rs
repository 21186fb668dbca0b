//! Backend sessions and the transport they wrap.
//!
//! A [`BackendSession`] is one multiplexed connection to the backend for a
//! single identity. The pool hands out channel leases on it; the actual
//! byte movement happens behind [`SessionTransport`], so the pool can be
//! exercised against a mock transport in tests and the production
//! WebSocket link in the binary.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TunnelError;
use crate::tunnel::frame::Frame;

/// Bidirectional frame exchange with the backend.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Send one frame and wait for its correlated reply.
    async fn exchange(&self, frame: Frame) -> Result<Frame, TunnelError>;
    /// Tear down the underlying stream.
    async fn close(&self);
}

/// Opens new backend sessions for an identity.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<Box<dyn SessionTransport>, TunnelError>;
}

/// One pooled backend session.
pub struct BackendSession {
    pub id: String,
    pub identity: String,
    pub created_at: Instant,
    last_used: Mutex<Instant>,
    open_channels: AtomicU32,
    healthy: AtomicBool,
    transport: Box<dyn SessionTransport>,
}

impl BackendSession {
    pub fn new(identity: impl Into<String>, transport: Box<dyn SessionTransport>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            identity: identity.into(),
            created_at: now,
            last_used: Mutex::new(now),
            open_channels: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            transport,
        }
    }

    /// Forward a frame over this session and wait for the reply.
    pub async fn exchange(&self, frame: Frame) -> Result<Frame, TunnelError> {
        self.touch();
        let result = self.transport.exchange(frame).await;
        if let Err(ref e) = result {
            // A transport-level failure poisons the session; application
            // errors from the backend do not.
            if matches!(e, TunnelError::Network(_)) {
                self.mark_unhealthy();
            }
        }
        result
    }

    pub async fn close(&self) {
        self.healthy.store(false, Ordering::Relaxed);
        self.transport.close().await;
    }

    pub fn touch(&self) {
        *self.last_used.lock().expect("session clock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("session clock poisoned")
            .elapsed()
    }

    pub fn open_channels(&self) -> u32 {
        self.open_channels.load(Ordering::Relaxed)
    }

    pub(crate) fn lease_channel(&self) {
        self.open_channels.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn release_channel(&self) {
        let _ = self
            .open_channels
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.touch();
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Pretend the session was last used `age` ago. Test hook for eviction.
    #[cfg(test)]
    pub fn backdate(&self, age: Duration) {
        if let Some(past) = Instant::now().checked_sub(age) {
            *self.last_used.lock().expect("session clock poisoned") = past;
        }
    }
}
