use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::models::event::{iso_timestamp, DeadLetterPayload, RawEvent};
use crate::services::errors::{is_retryable, ProcessingError};
use crate::services::queue::DeadLetterSink;

/// Builds diagnostic payloads for terminally failed events and emits them.
pub struct DeadLetterPublisher {
    sink: Arc<dyn DeadLetterSink>,
    source_topic: String,
    max_retries: u32,
}

impl DeadLetterPublisher {
    pub fn new(sink: Arc<dyn DeadLetterSink>, source_topic: impl Into<String>, max_retries: u32) -> Self {
        Self {
            sink,
            source_topic: source_topic.into(),
            max_retries,
        }
    }

    pub fn build_payload(
        &self,
        item_id: Option<i64>,
        error: &ProcessingError,
        event: &RawEvent,
        retry_count: u32,
        is_permanent: bool,
    ) -> DeadLetterPayload {
        DeadLetterPayload {
            error: error.to_string(),
            error_type: error.error_type().to_string(),
            topic: self.source_topic.clone(),
            original_message: event.original_message(),
            timestamp: iso_timestamp(Utc::now()),
            item_id,
            retry_count,
            max_retries: self.max_retries,
            is_permanent_error: is_permanent,
            is_retryable: !is_permanent && is_retryable(error),
        }
    }

    /// Emit a payload. Failures are logged and swallowed; returns whether the
    /// channel accepted it.
    pub async fn publish(
        &self,
        item_id: Option<i64>,
        error: &ProcessingError,
        event: &RawEvent,
        retry_count: u32,
        is_permanent: bool,
    ) -> bool {
        let payload = self.build_payload(item_id, error, event, retry_count, is_permanent);
        match self.sink.send(&payload).await {
            Ok(()) => {
                metrics::counter!("moderation_dead_letters_total").increment(1);
                info!(
                    item_id = ?item_id,
                    retry_count,
                    permanent = is_permanent,
                    "Sent message to DLQ"
                );
                true
            }
            Err(e) => {
                metrics::counter!("moderation_dead_letter_errors_total").increment(1);
                error!(item_id = ?item_id, error = %e, "Failed to send to DLQ");
                false
            }
        }
    }
}
