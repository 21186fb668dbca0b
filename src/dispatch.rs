//! Admission and dispatch path.
//!
//! [`Dispatcher`] ties the flow-control components together. A submitted
//! operation either goes straight to a backend session (link up) or into
//! the per-tenant queue (link down); when the link comes back the queue
//! flushes through the same admission path:
//!
//! ```text
//! submit ──► RateLimiter ──► CircuitBreaker ──► ConnectionPool ──► session
//!                 │                                   ▲
//!                 └──────────► RequestQueue ──────────┘  (flush on reconnect)
//! ```
//!
//! Limiter and breaker rejections return synchronously — the caller decides
//! whether to retry. Transport-level failures requeue the operation instead
//! of losing it.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitSnapshot};
use crate::config::Config;
use crate::error::{ErrorCategory, TunnelError};
use crate::limiter::RateLimiter;
use crate::metrics;
use crate::pool::session::SessionConnector;
use crate::pool::ConnectionPool;
use crate::queue::store::OperationStore;
use crate::queue::{Operation, RequestQueue};
use crate::state::LinkStats;
use crate::tunnel::frame::Frame;
use crate::util::now_ms;

/// Successful dispatch of one operation.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub status_code: u16,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub latency_ms: u64,
}

/// What happened to a submitted operation.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Forwarded to the backend; the response is attached.
    Dispatched(DispatchResult),
    /// Buffered for the next flush. `depth` is the tenant's queue depth
    /// after the enqueue.
    Queued { depth: usize },
}

/// Counters returned by a flush pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushSummary {
    pub dispatched: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Admission and dispatch core.
pub struct Dispatcher {
    config: Arc<Config>,
    limiter: RateLimiter,
    queue: RequestQueue,
    pool: ConnectionPool,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    link_stats: Arc<LinkStats>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn SessionConnector>,
        store: Option<Arc<dyn OperationStore>>,
        link_stats: Arc<LinkStats>,
    ) -> Self {
        let mut queue = RequestQueue::new(
            config.queue.capacity,
            config.queue.backpressure_threshold,
        );
        if let Some(store) = store {
            queue = queue.with_store(store);
        }
        Self {
            limiter: RateLimiter::new(config.limits.clone()),
            queue,
            pool: ConnectionPool::new(config.pool.clone(), connector),
            breakers: RwLock::new(HashMap::new()),
            link_stats,
            config,
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn link_up(&self) -> bool {
        self.link_stats.connected.load(Ordering::Relaxed)
    }

    fn breaker_for(&self, identity: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().expect("breaker map lock poisoned");
            if let Some(breaker) = breakers.get(identity) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = self.breakers.write().expect("breaker map lock poisoned");
        Arc::clone(breakers.entry(identity.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::from_config(identity, &self.config.breaker))
        }))
    }

    /// Breaker state per identity, for diagnostics.
    pub fn breaker_snapshots(&self) -> HashMap<String, CircuitSnapshot> {
        let breakers = self.breakers.read().expect("breaker map lock poisoned");
        breakers
            .iter()
            .map(|(id, b)| (id.clone(), b.snapshot()))
            .collect()
    }

    /// Submit one operation for forwarding.
    ///
    /// Link down ⇒ the operation is buffered (capacity and backpressure
    /// rules apply). Link up ⇒ it must pass the rate limiter and circuit
    /// breaker; rejections surface synchronously without queueing.
    pub async fn submit(
        &self,
        mut op: Operation,
        source_addr: Option<&str>,
    ) -> Result<SubmitOutcome, TunnelError> {
        if op.is_expired(now_ms()) {
            return Err(TunnelError::OperationExpired { id: op.id });
        }

        if !self.link_up() {
            let identity = op.identity.clone();
            self.queue.enqueue(op)?;
            metrics::record_queued(&identity);
            return Ok(SubmitOutcome::Queued {
                depth: self.queue.depth(&identity),
            });
        }

        let decision = self.limiter.check(&op.identity, source_addr);
        if !decision.allowed {
            return Err(TunnelError::RateLimited {
                identity: op.identity,
                retry_after: decision.retry_after.unwrap_or(0.0),
            });
        }

        match self.dispatch_now(&op).await {
            Ok(result) => {
                metrics::record_forwarded(&op.identity);
                Ok(SubmitOutcome::Dispatched(result))
            }
            // The transport failed underneath us — buffer rather than lose.
            Err(e) if e.category() == ErrorCategory::Network => {
                debug!(op_id = %op.id, "Dispatch hit transport failure, buffering: {e}");
                op.retries += 1;
                let identity = op.identity.clone();
                self.queue.enqueue(op)?;
                metrics::record_queued(&identity);
                Ok(SubmitOutcome::Queued {
                    depth: self.queue.depth(&identity),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// One admitted dispatch: lease a channel, exchange the frame, release.
    /// The breaker wraps only the backend exchange, so local saturation
    /// (session caps) cannot trip it.
    async fn dispatch_now(&self, op: &Operation) -> Result<DispatchResult, TunnelError> {
        let session = self.pool.acquire(&op.identity).await?;
        let breaker = self.breaker_for(&op.identity);

        let frame = Frame::Forward {
            id: op.id.clone(),
            payload: op.payload.clone(),
            headers: op.headers.clone(),
            timeout_ms: op.timeout_ms,
        };
        let started = Instant::now();
        let deadline = Duration::from_millis(op.timeout_ms.max(1));

        let outcome = breaker
            .execute(|| async {
                match tokio::time::timeout(deadline, session.exchange(frame)).await {
                    Ok(reply) => reply,
                    Err(_) => Err(TunnelError::Network(format!(
                        "operation {} timed out after {}ms",
                        op.id, op.timeout_ms
                    ))),
                }
            })
            .await;
        self.pool.release(&op.identity, &session.id).await;

        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome? {
            Frame::Response {
                status_code,
                payload,
                headers,
                ..
            } => Ok(DispatchResult {
                status_code,
                payload,
                headers,
                latency_ms,
            }),
            Frame::Error {
                code,
                message,
                category,
                ..
            } => Err(error_frame(&code, &message, category)),
            other => Err(TunnelError::Protocol(format!(
                "unexpected reply frame: {other:?}"
            ))),
        }
    }

    /// Drain buffered operations through the full admission path. Called
    /// after the link comes back. An identity stops draining on its first
    /// retryable rejection so one slow tenant cannot spin the loop.
    pub async fn flush(&self) -> FlushSummary {
        let mut summary = FlushSummary::default();

        for identity in self.queue.identities_with_backlog() {
            while self.link_up() {
                let Some(mut op) = self.queue.dequeue(&identity) else {
                    break;
                };

                let decision = self.limiter.check(&identity, None);
                if !decision.allowed {
                    op.retries += 1;
                    if self.queue.enqueue(op).is_ok() {
                        summary.requeued += 1;
                    } else {
                        summary.dropped += 1;
                    }
                    break;
                }

                match self.dispatch_now(&op).await {
                    Ok(_) => {
                        metrics::record_forwarded(&identity);
                        summary.dispatched += 1;
                    }
                    Err(e) if e.retryable() => {
                        debug!(identity = %identity, op_id = %op.id, "Flush deferred: {e}");
                        op.retries += 1;
                        if self.queue.enqueue(op).is_ok() {
                            summary.requeued += 1;
                        } else {
                            summary.dropped += 1;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(identity = %identity, op_id = %op.id, "Dropping operation: {e}");
                        summary.dropped += 1;
                    }
                }
            }
        }

        if summary.dispatched + summary.requeued + summary.dropped > 0 {
            info!(
                dispatched = summary.dispatched,
                requeued = summary.requeued,
                dropped = summary.dropped,
                "Queue flush complete"
            );
        }
        summary
    }

    /// Reload persisted high-priority mirrors. Called once at startup.
    pub fn restore_persisted(&self) -> Result<usize, TunnelError> {
        self.queue.restore_persisted()
    }

    /// Periodic housekeeping: evict idle sessions and rate buckets.
    pub async fn sweep(&self) {
        let evicted = self
            .pool
            .evict_idle(Duration::from_secs(self.config.pool.idle_timeout_secs))
            .await;
        let buckets = self
            .limiter
            .evict_idle(Duration::from_secs(self.config.limits.bucket_idle_secs));
        if evicted > 0 || buckets > 0 {
            debug!(sessions = evicted, buckets, "Sweep complete");
        }
    }
}

/// Map a backend error frame onto the local taxonomy.
fn error_frame(code: &str, message: &str, category: ErrorCategory) -> TunnelError {
    let detail = format!("{code}: {message}");
    match category {
        ErrorCategory::Network => TunnelError::Network(detail),
        ErrorCategory::Authentication => TunnelError::Authentication(detail),
        ErrorCategory::Configuration => TunnelError::Configuration(detail),
        ErrorCategory::Server => TunnelError::Server(detail),
        ErrorCategory::Protocol => TunnelError::Protocol(detail),
        ErrorCategory::Unknown => TunnelError::Unknown(detail),
    }
}
