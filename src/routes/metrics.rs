use axum::extract::State;
use axum::response::IntoResponse;

use crate::app_state::AppState;

/// Prometheus text exposition of the worker's counters and histograms.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}
