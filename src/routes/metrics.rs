//! Prometheus scrape endpoint.

use axum::extract::State;

use crate::state::AppState;

/// `GET /api/metrics` — pull-format counters, gauges, and histograms.
///
/// Gauges that are cheaper to sample than to maintain are refreshed here,
/// right before render, so scrapes always see current values.
pub async fn metrics(State(state): State<AppState>) -> String {
    for (identity, depth) in state.dispatcher.queue().depths() {
        crate::metrics::record_queue_depth(&identity, depth);
    }
    crate::metrics::record_active_sessions(state.dispatcher.pool().session_count().await);

    state.metrics.render()
}
