//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::tunnel::reconnect::ReconnectionManager;

/// Maximum number of pong RTT samples kept for quality tracking.
const MAX_RTT_SAMPLES: usize = 20;

/// Shared state for the rtun gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the gateway started (for uptime calculation).
    pub start_time: Instant,
    /// Admission and dispatch core (limiter, breakers, queue, pool).
    pub dispatcher: Arc<Dispatcher>,
    /// Link state machine, owned by the reconnect supervisor.
    pub reconnect: Arc<ReconnectionManager>,
    /// Link counters and RTT window.
    pub link_stats: Arc<LinkStats>,
    /// Prometheus recorder handle for the metrics route.
    pub metrics: PrometheusHandle,
}

/// Link statistics — atomics for lock-free hot-path updates, a mutex only
/// for the RTT window (cold path).
pub struct LinkStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    /// Epoch ms of the last matched pong. 0 until the first one.
    pub last_pong_ms: AtomicU64,
    pub dropped_outbound: AtomicU64,
    rtt_samples: Mutex<VecDeque<u64>>,
}

impl LinkStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(0),
            dropped_outbound: AtomicU64::new(0),
            rtt_samples: Mutex::new(VecDeque::with_capacity(MAX_RTT_SAMPLES)),
        }
    }

    /// Record a pong RTT sample, evicting the oldest at capacity.
    pub fn record_rtt(&self, rtt_ms: u64) {
        let mut samples = self.rtt_samples.lock().expect("rtt lock poisoned");
        if samples.len() >= MAX_RTT_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(rtt_ms);
    }

    /// Median and p95 RTT from the sample window, or `None` if empty.
    pub fn rtt_stats(&self) -> Option<(u64, u64)> {
        let samples = self.rtt_samples.lock().expect("rtt lock poisoned");
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let p95_idx = (sorted.len() as f64 * 0.95).ceil() as usize;
        let p95 = sorted[p95_idx.min(sorted.len() - 1)];
        Some((median, p95))
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_window_is_bounded() {
        let stats = LinkStats::new();
        for i in 0..100 {
            stats.record_rtt(i);
        }
        let (median, p95) = stats.rtt_stats().expect("samples");
        // Only the last 20 samples (80..99) remain.
        assert!(median >= 80);
        assert!(p95 <= 99);
    }

    #[test]
    fn empty_window_has_no_stats() {
        assert!(LinkStats::new().rtt_stats().is_none());
    }
}
