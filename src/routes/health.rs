use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
    pub model: ComponentHealth,
    pub streams: Vec<StreamHealth>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct StreamHealth {
    pub key: String,
    pub length: Option<u64>,
}

impl ComponentHealth {
    fn ok(latency_ms: Option<u64>) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms,
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health — dependency status for the worker.
///
/// A missing model does not make the worker unhealthy: events keep being
/// retried and dead-lettered, and the model is reloaded on demand.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_start = std::time::Instant::now();
    let db_check = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth::ok(Some(db_start.elapsed().as_millis() as u64)),
        Err(_) => ComponentHealth::error(),
    };

    let redis_start = std::time::Instant::now();
    let redis_check = match state.streams.health_check().await {
        Ok(_) => ComponentHealth::ok(Some(redis_start.elapsed().as_millis() as u64)),
        Err(_) => ComponentHealth::error(),
    };

    let model_check = if state.model_status.is_loaded() {
        ComponentHealth::ok(None)
    } else {
        ComponentHealth {
            status: "not_loaded".to_string(),
            latency_ms: None,
        }
    };

    let mut streams = Vec::with_capacity(state.stream_keys.len());
    for key in state.stream_keys.iter() {
        let length = state.streams.stream_length(key).await.ok();
        metrics::gauge!("moderation_stream_length", "stream" => key.clone())
            .set(length.unwrap_or(0) as f64);
        streams.push(StreamHealth {
            key: key.clone(),
            length,
        });
    }

    let all_healthy = db_check.is_ok() && redis_check.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
            model: model_check,
            streams,
        },
    };

    (status_code, Json(response))
}
