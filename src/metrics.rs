//! Metric registration and recording helpers.
//!
//! All counters/gauges/histograms flow through the `metrics` facade into a
//! Prometheus recorder rendered by `GET /api/metrics`. Helpers here keep
//! metric names in one place so call sites stay one-liners.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and register metric descriptions.
/// Returns the handle the metrics route renders from.
pub fn init() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install metrics recorder");

    describe_gauge!("rtun_queue_depth", "Buffered operations per identity");
    describe_counter!(
        "rtun_operations_expired_total",
        "Operations dropped past their deadline"
    );
    describe_counter!(
        "rtun_rate_limited_total",
        "Operations rejected by the rate limiter"
    );
    describe_gauge!(
        "rtun_circuit_state",
        "Circuit state per identity (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "rtun_reconnect_attempts_total",
        "Tunnel reconnection attempts"
    );
    describe_histogram!("rtun_heartbeat_rtt_ms", "Heartbeat round-trip time");
    describe_gauge!("rtun_active_sessions", "Open backend sessions");
    describe_counter!(
        "rtun_operations_forwarded_total",
        "Operations handed to a backend session"
    );
    describe_counter!("rtun_operations_queued_total", "Operations buffered");

    handle
}

pub fn record_queue_depth(identity: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rtun_queue_depth", "identity" => identity.to_string()).set(depth as f64);
}

pub fn record_operation_expired(identity: &str) {
    counter!("rtun_operations_expired_total", "identity" => identity.to_string()).increment(1);
}

pub fn record_rate_limited(identity: &str) {
    counter!("rtun_rate_limited_total", "identity" => identity.to_string()).increment(1);
}

pub fn record_circuit_state(identity: &str, state: f64) {
    gauge!("rtun_circuit_state", "identity" => identity.to_string()).set(state);
}

pub fn record_reconnect_attempt() {
    counter!("rtun_reconnect_attempts_total").increment(1);
}

pub fn record_heartbeat_rtt(rtt_ms: u64) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("rtun_heartbeat_rtt_ms").record(rtt_ms as f64);
}

pub fn record_active_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rtun_active_sessions").set(count as f64);
}

pub fn record_forwarded(identity: &str) {
    counter!("rtun_operations_forwarded_total", "identity" => identity.to_string()).increment(1);
}

pub fn record_queued(identity: &str) {
    counter!("rtun_operations_queued_total", "identity" => identity.to_string()).increment(1);
}
