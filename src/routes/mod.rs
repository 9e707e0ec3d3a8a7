use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod health;
pub mod metrics;

/// Admin router: liveness/dependency checks and the Prometheus scrape endpoint.
pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::prometheus_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
