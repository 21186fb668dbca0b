//! Link state machine and reconnection driver.
//!
//! [`ReconnectionManager`] owns the [`TunnelLink`] record exclusively and
//! is the only place that mutates its state. A reconnect cycle runs up to
//! `max_attempts` tries with exponentially growing, jittered delays; the
//! backoff sleep is the one long suspend in the system and is cancellable.
//! Cancellation leaves the link Disconnected; exhaustion leaves it Failed,
//! and nothing retries automatically until [`ReconnectionManager::reset`]
//! is called.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::metrics;
use crate::util::now_ms;

/// Maximum lifecycle events retained on the link.
const MAX_LINK_EVENTS: usize = 50;

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Link lifecycle event kinds.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkEventType {
    Connected,
    Disconnected,
    PongTimeout,
    ReconnectAttempt,
    ReconnectExhausted,
    Cancelled,
}

/// One entry in the link's bounded event history.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEvent {
    pub at_ms: u64,
    pub event: LinkEventType,
    pub detail: String,
}

/// The logical transport connection record.
struct TunnelLink {
    state: LinkState,
    attempts: u32,
    has_connected: bool,
    last_activity: Instant,
    events: VecDeque<LinkEvent>,
}

impl TunnelLink {
    fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            attempts: 0,
            has_connected: false,
            last_activity: Instant::now(),
            events: VecDeque::with_capacity(MAX_LINK_EVENTS),
        }
    }

    fn push_event(&mut self, event: LinkEventType, detail: String) {
        if self.events.len() >= MAX_LINK_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(LinkEvent {
            at_ms: now_ms(),
            event,
            detail,
        });
    }
}

/// Reconnect policy extracted from [`TunnelConfig`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&TunnelConfig> for ReconnectPolicy {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_secs(config.reconnect_base_delay_secs),
            max_delay: Duration::from_secs(config.reconnect_max_delay_secs),
        }
    }
}

/// Delay for a given attempt with an explicit jitter fraction.
/// `min(max_delay, base * 2^(n-1) * (1 + jitter))`.
fn delay_for_attempt(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    #[allow(clippy::cast_possible_wrap)]
    let exponential = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let jittered = exponential * (1.0 + jitter);
    Duration::from_secs_f64(jittered.min(max.as_secs_f64()).max(0.0))
}

/// Delay for a given attempt with jitter drawn uniformly from [-0.3, +0.3].
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let jitter = rand::rng().random_range(-0.3..=0.3);
    delay_for_attempt(attempt, base, max, jitter)
}

/// Drives transport re-establishment for one link.
pub struct ReconnectionManager {
    policy: ReconnectPolicy,
    link: Mutex<TunnelLink>,
    cancel: Mutex<CancellationToken>,
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            link: Mutex::new(TunnelLink::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Run `connect` until it succeeds, the attempt budget is spent, or the
    /// cycle is cancelled. On success the attempt counter resets and the
    /// caller is expected to flush the request queue.
    pub async fn attempt_reconnect<F, Fut, T>(&self, mut connect: F) -> Result<T, TunnelError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TunnelError>>,
    {
        let cancel = self.cancel.lock().expect("link lock poisoned").clone();

        for attempt in 1..=self.policy.max_attempts {
            {
                let mut link = self.link.lock().expect("link lock poisoned");
                link.state = if link.has_connected {
                    LinkState::Reconnecting
                } else {
                    LinkState::Connecting
                };
                link.attempts = attempt;
                link.push_event(LinkEventType::ReconnectAttempt, format!("attempt {attempt}"));
            }
            metrics::record_reconnect_attempt();
            info!(attempt, max = self.policy.max_attempts, "Connecting to relay");

            match connect(attempt).await {
                Ok(value) => {
                    let mut link = self.link.lock().expect("link lock poisoned");
                    link.state = LinkState::Connected;
                    link.attempts = 0;
                    link.has_connected = true;
                    link.last_activity = Instant::now();
                    link.push_event(LinkEventType::Connected, format!("after {attempt} attempt(s)"));
                    info!(attempt, "Link established");
                    return Ok(value);
                }
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay =
                        backoff_delay(attempt, self.policy.base_delay, self.policy.max_delay);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Connect failed: {e}, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            let mut link = self.link.lock().expect("link lock poisoned");
                            link.state = LinkState::Disconnected;
                            link.push_event(
                                LinkEventType::Cancelled,
                                format!("cancelled during attempt {attempt} backoff"),
                            );
                            info!("Reconnect cycle cancelled");
                            return Err(TunnelError::Cancelled);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(attempt, "Connect failed on final attempt: {e}");
                }
            }
        }

        let mut link = self.link.lock().expect("link lock poisoned");
        link.state = LinkState::Failed;
        link.push_event(
            LinkEventType::ReconnectExhausted,
            format!("{} attempts", self.policy.max_attempts),
        );
        warn!(
            attempts = self.policy.max_attempts,
            "Reconnect attempts exhausted, link failed"
        );
        Err(TunnelError::ReconnectExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// Record loss of an established link before a new cycle starts.
    pub fn note_disconnected(&self, detail: &str) {
        let mut link = self.link.lock().expect("link lock poisoned");
        if link.state == LinkState::Connected {
            link.state = LinkState::Disconnected;
        }
        link.push_event(LinkEventType::Disconnected, detail.to_string());
    }

    /// Record a heartbeat-declared death.
    pub fn note_pong_timeout(&self) {
        let mut link = self.link.lock().expect("link lock poisoned");
        link.push_event(LinkEventType::PongTimeout, String::new());
    }

    pub fn touch_activity(&self) {
        self.link.lock().expect("link lock poisoned").last_activity = Instant::now();
    }

    /// Abort the in-progress backoff wait, leaving the link Disconnected.
    pub fn cancel(&self) {
        self.cancel.lock().expect("link lock poisoned").cancel();
    }

    /// Re-arm a Failed or cancelled link for another externally-triggered
    /// cycle.
    pub fn reset(&self) {
        let mut cancel = self.cancel.lock().expect("link lock poisoned");
        *cancel = CancellationToken::new();
        let mut link = self.link.lock().expect("link lock poisoned");
        link.state = LinkState::Disconnected;
        link.attempts = 0;
    }

    pub fn state(&self) -> LinkState {
        self.link.lock().expect("link lock poisoned").state
    }

    pub fn attempts(&self) -> u32 {
        self.link.lock().expect("link lock poisoned").attempts
    }

    pub fn seconds_since_activity(&self) -> u64 {
        self.link
            .lock()
            .expect("link lock poisoned")
            .last_activity
            .elapsed()
            .as_secs()
    }

    /// Most recent lifecycle events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<LinkEvent> {
        let link = self.link.lock().expect("link lock poisoned");
        link.events.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, base_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms * 16),
        }
    }

    #[test]
    fn unjittered_backoff_grows_monotonically_to_the_cap() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);

        let mut previous = Duration::ZERO;
        for attempt in 1..=5 {
            let delay = delay_for_attempt(attempt, base, max, 0.0);
            assert!(delay >= previous, "delay must not shrink");
            assert!(delay <= max, "delay must respect the ceiling");
            previous = delay;
        }
        // 2, 4, 8, 16, 32 — then capped.
        assert_eq!(delay_for_attempt(5, base, max, 0.0), Duration::from_secs(32));
        assert_eq!(delay_for_attempt(10, base, max, 0.0), max);
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);

        for attempt in 1..=5 {
            let unjittered = delay_for_attempt(attempt, base, max, 0.0);
            let low = delay_for_attempt(attempt, base, max, -0.3);
            let high = delay_for_attempt(attempt, base, max, 0.3);
            assert!(low.as_secs_f64() >= unjittered.as_secs_f64() * 0.7 - 1e-9);
            assert!(high.as_secs_f64() <= (unjittered.as_secs_f64() * 1.3).min(max.as_secs_f64()) + 1e-9);

            for _ in 0..100 {
                let sampled = backoff_delay(attempt, base, max);
                assert!(sampled >= low && sampled <= high);
            }
        }
    }

    #[tokio::test]
    async fn success_resets_the_attempt_counter() {
        let manager = ReconnectionManager::new(policy(10, 5));
        let calls = AtomicU32::new(0);

        let result = manager
            .attempt_reconnect(|_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TunnelError::Network("refused".into()))
                    } else {
                        Ok("link")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("connects on third try"), "link");
        assert_eq!(manager.state(), LinkState::Connected);
        assert_eq!(manager.attempts(), 0);
    }

    #[tokio::test]
    async fn exhaustion_marks_the_link_failed() {
        let manager = ReconnectionManager::new(policy(3, 1));

        let err = manager
            .attempt_reconnect(|_attempt| async {
                Err::<(), _>(TunnelError::Network("refused".into()))
            })
            .await
            .expect_err("all attempts fail");

        assert_eq!(err.code(), "RECONNECT_EXHAUSTED");
        assert_eq!(manager.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn cancellation_leaves_the_link_disconnected() {
        let manager = Arc::new(ReconnectionManager::new(ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }));

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .attempt_reconnect(|_attempt| async {
                        Err::<(), _>(TunnelError::Network("refused".into()))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.cancel();

        let err = task.await.expect("join").expect_err("cancelled");
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(manager.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn reset_rearms_a_failed_link() {
        let manager = ReconnectionManager::new(policy(1, 1));
        let _ = manager
            .attempt_reconnect(|_attempt| async {
                Err::<(), _>(TunnelError::Network("refused".into()))
            })
            .await;
        assert_eq!(manager.state(), LinkState::Failed);

        manager.reset();
        assert_eq!(manager.state(), LinkState::Disconnected);

        let result = manager
            .attempt_reconnect(|_attempt| async { Ok::<_, TunnelError>(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(manager.state(), LinkState::Connected);
    }

    #[test]
    fn event_ring_is_bounded() {
        let manager = ReconnectionManager::new(policy(1, 1));
        for _ in 0..200 {
            manager.note_pong_timeout();
        }
        assert_eq!(manager.recent_events(usize::MAX).len(), MAX_LINK_EVENTS);
    }
}
