//! Per-identity backend session pool.
//!
//! [`ConnectionPool`] is the single authority for backend session
//! lifecycle. Sessions are scoped to one identity and never shared across
//! identities — this is the primary multi-tenant isolation boundary.
//! Acquire prefers an existing healthy session with spare channel
//! capacity, creates a new session while under the per-identity cap, and
//! fails otherwise. A periodic sweep closes sessions that sat idle past
//! the timeout and drops identities whose session set became empty.
//!
//! ## Concurrency
//!
//! The identity map is behind an `RwLock`; each identity's session set is
//! behind its own `Mutex`, held across the count-check and connect so
//! concurrent acquires cannot overshoot the session cap. The sweep locks
//! one identity at a time.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::error::TunnelError;
use crate::metrics;
use session::{BackendSession, SessionConnector};

/// Session set for one identity.
struct TenantSessions {
    sessions: Vec<Arc<BackendSession>>,
}

/// Per-session view for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub open_channels: u32,
    pub idle_secs: u64,
    pub age_secs: u64,
    pub healthy: bool,
}

/// Multiplexed backend session pool with per-identity limits.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn SessionConnector>,
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantSessions>>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            config,
            connector,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    async fn tenant(&self, identity: &str) -> Arc<Mutex<TenantSessions>> {
        {
            let tenants = self.tenants.read().await;
            if let Some(tenant) = tenants.get(identity) {
                return Arc::clone(tenant);
            }
        }
        let mut tenants = self.tenants.write().await;
        Arc::clone(tenants.entry(identity.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TenantSessions {
                sessions: Vec::new(),
            }))
        }))
    }

    /// Lease a channel on a session for `identity`.
    ///
    /// The tenant lock is held through the check-and-connect so concurrent
    /// acquires for one identity serialize and the session cap holds.
    pub async fn acquire(&self, identity: &str) -> Result<Arc<BackendSession>, TunnelError> {
        let tenant = self.tenant(identity).await;
        let mut tenant = tenant.lock().await;

        // Drop poisoned sessions that have no channels left on them.
        tenant
            .sessions
            .retain(|s| s.is_healthy() || s.open_channels() > 0);

        if let Some(existing) = tenant
            .sessions
            .iter()
            .find(|s| s.is_healthy() && s.open_channels() < self.config.max_channels_per_session)
        {
            existing.lease_channel();
            return Ok(Arc::clone(existing));
        }

        if tenant.sessions.len() >= self.config.max_sessions_per_identity {
            return Err(TunnelError::LimitExceeded {
                identity: identity.to_string(),
                max_sessions: self.config.max_sessions_per_identity,
            });
        }

        let transport = self.connector.connect(identity).await?;
        let session = Arc::new(BackendSession::new(identity, transport));
        session.lease_channel();
        info!(
            identity,
            session_id = %session.id,
            total = tenant.sessions.len() + 1,
            "Opened backend session"
        );
        tenant.sessions.push(Arc::clone(&session));
        drop(tenant);

        metrics::record_active_sessions(self.session_count().await);
        Ok(session)
    }

    /// Return a channel lease on `session_id`.
    pub async fn release(&self, identity: &str, session_id: &str) {
        let tenant = self.tenant(identity).await;
        let tenant = tenant.lock().await;
        if let Some(session) = tenant.sessions.iter().find(|s| s.id == session_id) {
            session.release_channel();
        }
    }

    /// Close sessions unused longer than `max_idle` and drop identities
    /// left without sessions. Returns how many sessions were closed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let identities: Vec<String> = {
            let tenants = self.tenants.read().await;
            tenants.keys().cloned().collect()
        };

        let mut evicted = 0;
        let mut emptied = Vec::new();
        for identity in identities {
            let tenant = {
                let tenants = self.tenants.read().await;
                match tenants.get(&identity) {
                    Some(tenant) => Arc::clone(tenant),
                    None => continue,
                }
            };
            let mut tenant = tenant.lock().await;

            let mut kept = Vec::with_capacity(tenant.sessions.len());
            for session in tenant.sessions.drain(..) {
                let expired = session.open_channels() == 0 && session.idle_for() > max_idle;
                if expired || (!session.is_healthy() && session.open_channels() == 0) {
                    debug!(
                        identity = %identity,
                        session_id = %session.id,
                        idle_secs = session.idle_for().as_secs(),
                        "Evicting backend session"
                    );
                    session.close().await;
                    evicted += 1;
                } else {
                    kept.push(session);
                }
            }
            tenant.sessions = kept;
            if tenant.sessions.is_empty() {
                emptied.push(identity);
            }
        }

        if !emptied.is_empty() {
            let mut tenants = self.tenants.write().await;
            for identity in emptied {
                let still_empty = tenants
                    .get(&identity)
                    .is_some_and(|t| t.try_lock().is_ok_and(|t| t.sessions.is_empty()));
                if still_empty {
                    debug!(identity = %identity, "Removed identity with no remaining sessions");
                    tenants.remove(&identity);
                }
            }
        }

        if evicted > 0 {
            metrics::record_active_sessions(self.session_count().await);
        }
        evicted
    }

    /// Total open sessions across identities.
    pub async fn session_count(&self) -> usize {
        let tenants = self.tenants.read().await;
        let mut count = 0;
        for tenant in tenants.values() {
            count += tenant.lock().await.sessions.len();
        }
        count
    }

    /// Number of identities with pool state.
    pub async fn identity_count(&self) -> usize {
        self.tenants.read().await.len()
    }

    /// Per-identity session details for diagnostics.
    pub async fn snapshot(&self) -> HashMap<String, Vec<SessionInfo>> {
        let tenants = self.tenants.read().await;
        let mut out = HashMap::with_capacity(tenants.len());
        for (identity, tenant) in tenants.iter() {
            let tenant = tenant.lock().await;
            out.insert(
                identity.clone(),
                tenant
                    .sessions
                    .iter()
                    .map(|s| SessionInfo {
                        id: s.id.clone(),
                        open_channels: s.open_channels(),
                        idle_secs: s.idle_for().as_secs(),
                        age_secs: s.created_at.elapsed().as_secs(),
                        healthy: s.is_healthy(),
                    })
                    .collect(),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::session::SessionTransport;
    use super::*;
    use crate::tunnel::frame::Frame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockTransport {
        identity: String,
    }

    #[async_trait]
    impl SessionTransport for MockTransport {
        async fn exchange(&self, frame: Frame) -> Result<Frame, TunnelError> {
            let id = frame.id().unwrap_or("").to_string();
            Ok(Frame::Response {
                id,
                status_code: 200,
                payload: self.identity.clone().into_bytes(),
                headers: HashMap::new(),
                latency_ms: 0,
            })
        }

        async fn close(&self) {}
    }

    struct MockConnector {
        connects: AtomicU32,
    }

    impl MockConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionConnector for MockConnector {
        async fn connect(&self, identity: &str) -> Result<Box<dyn SessionTransport>, TunnelError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockTransport {
                identity: identity.to_string(),
            }))
        }
    }

    fn pool_config(max_sessions: usize, max_channels: u32) -> PoolConfig {
        PoolConfig {
            max_sessions_per_identity: max_sessions,
            max_channels_per_session: max_channels,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn sessions_never_cross_identities() {
        let pool = Arc::new(ConnectionPool::new(pool_config(3, 10), MockConnector::new()));

        let a_pool = Arc::clone(&pool);
        let b_pool = Arc::clone(&pool);
        let (a_sessions, b_sessions) = tokio::join!(
            async move {
                let mut out = Vec::new();
                for _ in 0..20 {
                    out.push(a_pool.acquire("tenant-a").await.expect("acquire a"));
                }
                out
            },
            async move {
                let mut out = Vec::new();
                for _ in 0..20 {
                    out.push(b_pool.acquire("tenant-b").await.expect("acquire b"));
                }
                out
            },
        );

        assert!(a_sessions.iter().all(|s| s.identity == "tenant-a"));
        assert!(b_sessions.iter().all(|s| s.identity == "tenant-b"));
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let pool = ConnectionPool::new(pool_config(2, 1), MockConnector::new());

        pool.acquire("acme").await.expect("first session");
        pool.acquire("acme").await.expect("second session");
        let err = pool.acquire("acme").await.expect_err("over the cap");
        assert_eq!(err.code(), "SESSION_LIMIT");
    }

    #[tokio::test]
    async fn spare_channel_capacity_is_reused_before_connecting() {
        let connector = MockConnector::new();
        let pool = ConnectionPool::new(
            pool_config(3, 10),
            Arc::clone(&connector) as Arc<dyn SessionConnector>,
        );

        let first = pool.acquire("acme").await.expect("acquire");
        let second = pool.acquire("acme").await.expect("acquire");
        assert_eq!(first.id, second.id);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(first.open_channels(), 2);
    }

    #[tokio::test]
    async fn release_frees_a_channel() {
        let pool = ConnectionPool::new(pool_config(1, 1), MockConnector::new());

        let session = pool.acquire("acme").await.expect("acquire");
        assert!(pool.acquire("acme").await.is_err());

        pool.release("acme", &session.id).await;
        pool.acquire("acme").await.expect("channel free again");
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_fresh_ones_kept() {
        let pool = ConnectionPool::new(pool_config(3, 10), MockConnector::new());
        let max_idle = Duration::from_secs(60);

        let stale = pool.acquire("acme").await.expect("acquire");
        pool.release("acme", &stale.id).await;
        stale.backdate(max_idle + Duration::from_secs(1));

        let fresh = pool.acquire("globex").await.expect("acquire");
        pool.release("globex", &fresh.id).await;
        fresh.backdate(max_idle - Duration::from_secs(1));

        assert_eq!(pool.evict_idle(max_idle).await, 1);
        assert_eq!(pool.session_count().await, 1);
        // The emptied identity is gone from the pool entirely.
        assert_eq!(pool.identity_count().await, 1);
    }

    #[tokio::test]
    async fn busy_sessions_survive_eviction() {
        let pool = ConnectionPool::new(pool_config(3, 10), MockConnector::new());

        let busy = pool.acquire("acme").await.expect("acquire");
        busy.backdate(Duration::from_secs(3600));

        assert_eq!(pool.evict_idle(Duration::from_secs(60)).await, 0);
        assert_eq!(pool.session_count().await, 1);
    }
}
