use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;

use crate::services::prediction::ModelStatus;
use crate::services::queue::RedisStreams;

/// Shared state for the worker's admin endpoints.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub streams: Arc<RedisStreams>,
    pub prometheus: Arc<PrometheusHandle>,
    /// Live model availability, updated when a stream reloads its handle.
    pub model_status: ModelStatus,
    /// Stream keys consumed by this worker.
    pub stream_keys: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        streams: RedisStreams,
        prometheus: PrometheusHandle,
        model_status: ModelStatus,
        stream_keys: Vec<String>,
    ) -> Self {
        Self {
            db,
            streams: Arc::new(streams),
            prometheus: Arc::new(prometheus),
            model_status,
            stream_keys: Arc::new(stream_keys),
        }
    }
}
