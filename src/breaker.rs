//! Circuit breaker guarding calls into a backend.
//!
//! States: Closed (normal) → Open (fail fast) → HalfOpen (probing) →
//! Closed, or HalfOpen → Open on any probe failure. Failure counting is
//! plain consecutive counters — a success in Closed resets the count, no
//! rolling window.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::TunnelError;
use crate::metrics;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for the state gauge.
    fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Mutable breaker internals, all under one lock.
struct Core {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
    opened_at: Option<Instant>,
    open_count: u64,
}

/// Point-in-time view for the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub open_count: u64,
    pub seconds_in_state: u64,
}

/// One breaker per protected call path.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    core: Mutex<Core>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            reset_timeout,
            core: Mutex::new(Core {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
                last_transition: Instant::now(),
                opened_at: None,
                open_count: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            config.success_threshold,
            Duration::from_secs(config.reset_timeout_secs),
        )
    }

    /// Run `call` under the breaker. Fails fast with a circuit-open error
    /// while Open; otherwise the call's outcome updates the counters.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T, TunnelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TunnelError>>,
    {
        self.try_acquire()?;
        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Admission check. Transitions Open → HalfOpen once the reset timeout
    /// has elapsed since the circuit opened.
    pub fn try_acquire(&self) -> Result<(), TunnelError> {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        match core.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened_at = core.opened_at.unwrap_or(core.last_transition);
                let elapsed = opened_at.elapsed();
                if elapsed >= self.reset_timeout {
                    self.transition(&mut core, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(TunnelError::CircuitOpen {
                        retry_in: self.reset_timeout - elapsed,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        core.consecutive_failures = 0;
        match core.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                core.consecutive_successes += 1;
                if core.consecutive_successes >= self.success_threshold {
                    self.transition(&mut core, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // Success while open means an in-flight call outlived the
                // transition. Leave the state to the reset timer.
            }
        }
    }

    pub fn record_failure(&self) {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        core.consecutive_successes = 0;
        core.consecutive_failures += 1;
        core.last_failure = Some(Instant::now());
        match core.state {
            CircuitState::Closed => {
                if core.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = core.consecutive_failures,
                        "Circuit opening after consecutive failures"
                    );
                    self.transition(&mut core, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Probe failed, circuit re-opening");
                self.transition(&mut core, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, core: &mut Core, to: CircuitState) {
        let from = core.state;
        core.state = to;
        core.last_transition = Instant::now();
        match to {
            CircuitState::Open => {
                core.opened_at = Some(core.last_transition);
                core.open_count += 1;
            }
            CircuitState::HalfOpen => {
                core.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                core.consecutive_failures = 0;
                core.opened_at = None;
            }
        }
        info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit state transition"
        );
        metrics::record_circuit_state(&self.name, to.as_gauge());
    }

    /// Current state. Drives Open → HalfOpen if the reset timeout elapsed,
    /// so observers see the same state an execute would.
    pub fn state(&self) -> CircuitState {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        if core.state == CircuitState::Open {
            let opened_at = core.opened_at.unwrap_or(core.last_transition);
            if opened_at.elapsed() >= self.reset_timeout {
                self.transition(&mut core, CircuitState::HalfOpen);
            }
        }
        core.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let core = self.core.lock().expect("breaker lock poisoned");
        CircuitSnapshot {
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            open_count: core.open_count,
            seconds_in_state: core.last_transition.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn breaker(reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test", 5, 2, reset_timeout)
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .execute(|| async { Err::<(), _>(TunnelError::Server("boom".into())) })
            .await;
    }

    async fn succeed(b: &CircuitBreaker) {
        b.execute(|| async { Ok::<_, TunnelError>(()) })
            .await
            .expect("call succeeds");
    }

    #[tokio::test]
    async fn five_consecutive_failures_open_the_circuit() {
        let b = breaker(Duration::from_secs(60));
        for _ in 0..4 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling() {
        let b = breaker(Duration::from_secs(60));
        for _ in 0..5 {
            fail(&b).await;
        }

        let invoked = AtomicBool::new(false);
        let err = b
            .execute(|| {
                invoked.store(true, Ordering::SeqCst);
                async { Ok::<_, TunnelError>(()) }
            })
            .await
            .expect_err("must fail fast");
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reset_timeout_moves_open_to_half_open() {
        let b = breaker(Duration::from_millis(50));
        for _ in 0..5 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn two_half_open_successes_close_the_circuit() {
        let b = breaker(Duration::from_millis(50));
        for _ in 0..5 {
            fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        succeed(&b).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let b = breaker(Duration::from_millis(50));
        for _ in 0..5 {
            fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn closed_success_resets_the_failure_counter() {
        let b = breaker(Duration::from_secs(60));
        for _ in 0..4 {
            fail(&b).await;
        }
        succeed(&b).await;
        for _ in 0..4 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }
}
