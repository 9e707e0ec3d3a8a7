use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Admin HTTP bind address for /health and /metrics.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the event source and dead-letter stream
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stream key moderation requests are read from
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Stream key dead-letter payloads are appended to
    #[serde(default = "default_dlq_topic")]
    pub dlq_topic: String,

    /// Consumer group that owns the durable read position
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name inside the group. Must be stable across restarts so that
    /// unacknowledged entries are redelivered to this worker.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Base URL of the model backend (e.g. "http://model-registry:5000").
    #[serde(default)]
    pub model_backend_url: Option<String>,

    /// Request timeout for the model backend, in seconds.
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Use the built-in reference coefficients when the backend cannot serve a model.
    #[serde(default = "default_true")]
    pub reference_model_fallback: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in seconds; retry `n` waits `base_delay_secs * 2^n`.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Number of independent streams (`<topic>:0 .. <topic>:N-1` when N > 1).
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// How long a single XREADGROUP call blocks waiting for new entries.
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_topic() -> String {
    "moderation".to_string()
}

fn default_dlq_topic() -> String {
    "moderation_dlq".to_string()
}

fn default_consumer_group() -> String {
    "moderation-worker".to_string()
}

fn default_consumer_name() -> String {
    "worker-1".to_string()
}

fn default_model_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    3
}

fn default_partitions() -> u32 {
    1
}

fn default_read_block_ms() -> u64 {
    1000
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    /// Stream keys this worker consumes, one per partition.
    pub fn stream_keys(&self) -> Vec<String> {
        if self.partitions <= 1 {
            return vec![self.topic.clone()];
        }
        (0..self.partitions)
            .map(|p| format!("{}:{}", self.topic, p))
            .collect()
    }
}
