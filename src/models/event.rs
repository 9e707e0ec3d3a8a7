use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::errors::ProcessingError;

/// A decoded "item needs moderation" event.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationRequest {
    pub item_id: i64,
    /// Producer timestamp; informational only.
    pub timestamp: Option<String>,
}

/// Raw event body as read off the stream.
///
/// `body` keeps the parsed JSON (if any) so it can be forwarded verbatim to the
/// dead-letter channel even when the request itself is unusable.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub body: Option<Value>,
}

impl RawEvent {
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            body: serde_json::from_slice(bytes).ok(),
        }
    }

    /// Best-effort `item_id` for bookkeeping, even when decoding fails.
    pub fn item_id(&self) -> Option<i64> {
        self.body.as_ref()?.get("item_id")?.as_i64()
    }

    /// Decode into a request. A missing or non-integer `item_id` is permanent.
    pub fn decode(&self) -> Result<ModerationRequest, ProcessingError> {
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| ProcessingError::MalformedEvent("payload is not valid JSON".into()))?;

        let item_id = match body.get("item_id") {
            None | Some(Value::Null) => {
                return Err(ProcessingError::MalformedEvent(
                    "Missing 'item_id' in message".into(),
                ))
            }
            Some(v) => v.as_i64().ok_or_else(|| {
                ProcessingError::MalformedEvent(format!("'item_id' is not an integer: {}", v))
            })?,
        };

        let timestamp = body
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(ModerationRequest { item_id, timestamp })
    }

    /// Body to embed in a dead-letter payload; `{}` when unavailable.
    pub fn original_message(&self) -> Value {
        self.body
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

/// Diagnostic record appended to the dead-letter stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterPayload {
    pub error: String,
    pub error_type: String,
    pub topic: String,
    pub original_message: Value,
    pub timestamp: String,
    pub item_id: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_permanent_error: bool,
    pub is_retryable: bool,
}

/// ISO-8601 UTC with a `Z` suffix, matching the producer's format.
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
