//! Redis Streams plumbing: the moderation event source (consumer group with
//! explicit XACK) and the dead-letter stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::models::event::DeadLetterPayload;

/// Entries fetched per XREADGROUP call.
const READ_COUNT: usize = 10;

/// Field holding the JSON body in stream entries.
const PAYLOAD_FIELD: &str = "payload";

/// One entry read from the event source.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Ordered event channel with a durable, explicitly advanced read position.
#[async_trait]
pub trait EventSource: Send {
    /// Next entry in arrival order; `None` if nothing arrived within the poll window.
    async fn next(&mut self) -> Result<Option<StreamEntry>, QueueError>;

    /// Advance the read position past `entry_id`.
    async fn commit(&mut self, entry_id: &str) -> Result<(), QueueError>;
}

/// Destination for dead-letter payloads.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, payload: &DeadLetterPayload) -> Result<(), QueueError>;
}

/// Connection factory for the moderation streams.
pub struct RedisStreams {
    client: redis::Client,
}

impl RedisStreams {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Open a consumer on `stream_key`, creating the group if needed.
    pub async fn source(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<RedisStreamSource, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        ensure_group(&mut conn, stream_key, group).await?;
        Ok(RedisStreamSource {
            conn,
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            block,
            backlog_drained: false,
            buffered: VecDeque::new(),
        })
    }

    pub async fn dead_letter_sink(&self, dlq_key: &str) -> Result<RedisDeadLetterSink, QueueError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(RedisDeadLetterSink {
            conn,
            dlq_key: dlq_key.to_string(),
        })
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Number of entries currently held in a stream.
    pub async fn stream_length(&self, stream_key: &str) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(stream_key).await?;
        Ok(len)
    }
}

/// XGROUP CREATE ... MKSTREAM; an existing group is fine.
async fn ensure_group(
    conn: &mut MultiplexedConnection,
    stream_key: &str,
    group: &str,
) -> Result<(), QueueError> {
    match conn
        .xgroup_create_mkstream::<_, _, _, ()>(stream_key, group, "0")
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(QueueError::Redis(e)),
    }
}

/// Consumer-group reader for one stream.
///
/// On start it replays this consumer's own delivered-but-unacknowledged
/// entries (read id `0`) before asking for new ones (read id `>`), so events
/// interrupted by a crash are processed again.
pub struct RedisStreamSource {
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    consumer: String,
    block: Duration,
    backlog_drained: bool,
    buffered: VecDeque<StreamEntry>,
}

impl RedisStreamSource {
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn read(&mut self) -> Result<Vec<StreamEntry>, QueueError> {
        let (read_id, opts) = if self.backlog_drained {
            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(READ_COUNT)
                .block(self.block.as_millis() as usize);
            (">", opts)
        } else {
            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(READ_COUNT);
            ("0", opts)
        };

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream_key], &[read_id], &opts)
            .await?;

        let entries: Vec<StreamEntry> = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .map(|id| StreamEntry {
                payload: id.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default(),
                id: id.id,
            })
            .collect();

        if !self.backlog_drained && entries.is_empty() {
            tracing::debug!(stream = %self.stream_key, "Pending backlog drained");
            self.backlog_drained = true;
        }
        Ok(entries)
    }
}

#[async_trait]
impl EventSource for RedisStreamSource {
    async fn next(&mut self) -> Result<Option<StreamEntry>, QueueError> {
        if self.buffered.is_empty() {
            let entries = self.read().await?;
            self.buffered.extend(entries);
        }
        Ok(self.buffered.pop_front())
    }

    async fn commit(&mut self, entry_id: &str) -> Result<(), QueueError> {
        self.conn
            .xack::<_, _, _, u64>(&self.stream_key, &self.group, &[entry_id])
            .await?;
        Ok(())
    }
}

/// Appends dead-letter payloads to a stream.
pub struct RedisDeadLetterSink {
    conn: MultiplexedConnection,
    dlq_key: String,
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn send(&self, payload: &DeadLetterPayload) -> Result<(), QueueError> {
        let body = serde_json::to_string(payload)?;
        let item_id = payload.item_id.map(|id| id.to_string()).unwrap_or_default();
        let fields = [
            (PAYLOAD_FIELD, body),
            ("item_id", item_id),
            ("error_type", payload.error_type.clone()),
        ];
        let mut conn = self.conn.clone();
        conn.xadd::<_, _, _, _, String>(&self.dlq_key, "*", &fields)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemorySourceState {
    queue: VecDeque<StreamEntry>,
    in_flight: Vec<StreamEntry>,
    committed: Vec<String>,
    next_id: u64,
    fail_commits: bool,
}

/// In-process event source with the same delivery contract as the Redis one.
/// Clones share state, so a test can keep a handle while the loop owns another.
#[derive(Clone, Default)]
pub struct InMemoryEventSource {
    state: Arc<Mutex<MemorySourceState>>,
    poll_interval: Duration,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            poll_interval: Duration::from_millis(100),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemorySourceState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("in-memory source poisoned".into()))
    }

    /// Append a JSON body. Returns the entry id.
    pub fn push_json(&self, body: &serde_json::Value) -> String {
        self.push_raw(body.to_string().into_bytes())
    }

    pub fn push_raw(&self, payload: Vec<u8>) -> String {
        let Ok(mut state) = self.lock() else {
            return String::new();
        };
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state.queue.push_back(StreamEntry {
            id: id.clone(),
            payload,
        });
        id
    }

    pub fn committed(&self) -> Vec<String> {
        self.lock().map(|s| s.committed.clone()).unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Simulate a consumer restart: delivered but uncommitted entries go back
    /// to the front of the queue in their original order.
    pub fn redeliver_uncommitted(&self) {
        if let Ok(mut state) = self.lock() {
            let in_flight = std::mem::take(&mut state.in_flight);
            for entry in in_flight.into_iter().rev() {
                state.queue.push_front(entry);
            }
        }
    }

    pub fn set_fail_commits(&self, fail: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_commits = fail;
        }
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn next(&mut self) -> Result<Option<StreamEntry>, QueueError> {
        let entry = {
            let mut state = self.lock()?;
            let entry = state.queue.pop_front();
            if let Some(entry) = &entry {
                state.in_flight.push(entry.clone());
            }
            entry
        };
        if entry.is_none() {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(entry)
    }

    async fn commit(&mut self, entry_id: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.fail_commits {
            return Err(QueueError::Unavailable("commit rejected".into()));
        }
        state.in_flight.retain(|e| e.id != entry_id);
        state.committed.push(entry_id.to_string());
        Ok(())
    }
}

/// Records dead-letter payloads in memory; can be told to reject sends.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    sent: Arc<Mutex<Vec<DeadLetterPayload>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<DeadLetterPayload> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, payload: &DeadLetterPayload) -> Result<(), QueueError> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(QueueError::Unavailable("dead-letter channel rejected send".into()));
        }
        self.sent
            .lock()
            .map_err(|_| QueueError::Unavailable("dead-letter sink poisoned".into()))?
            .push(payload.clone());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Event channel unavailable: {0}")]
    Unavailable(String),
}
