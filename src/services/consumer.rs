//! The per-stream consumer loop.
//!
//! Events are handled strictly one at a time. The read position is committed
//! only after the event reached a terminal outcome (success, or failure with
//! its dead-letter emission attempted); a commit is never skipped after that.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::models::event::RawEvent;
use crate::services::dead_letter::DeadLetterPublisher;
use crate::services::orchestrator::{Outcome, RetryOrchestrator, TerminalFailure};
use crate::services::queue::{EventSource, QueueError, StreamEntry};
use crate::services::shutdown::Shutdown;

/// Pause after an event-source read error before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How an event was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    DeadLettered { permanent: bool, retry_count: u32 },
}

/// Result of one loop step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// An event reached a terminal outcome and its commit was attempted.
    Handled { entry_id: String, disposition: Disposition },
    /// Nothing arrived within the poll window.
    Idle,
    /// Shutdown requested; any in-flight event was left uncommitted.
    Stopped,
}

pub struct ConsumerLoop<S: EventSource> {
    stream: String,
    source: S,
    orchestrator: RetryOrchestrator,
    dead_letters: DeadLetterPublisher,
    shutdown: Shutdown,
}

impl<S: EventSource> ConsumerLoop<S> {
    pub fn new(
        stream: impl Into<String>,
        source: S,
        orchestrator: RetryOrchestrator,
        dead_letters: DeadLetterPublisher,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            stream: stream.into(),
            source,
            orchestrator,
            dead_letters,
            shutdown,
        }
    }

    /// Consume until shutdown. The source and dead-letter connections are
    /// dropped when this returns.
    pub async fn run(mut self) {
        info!(stream = %self.stream, "Consumer loop started");
        loop {
            match self.process_next().await {
                Ok(Step::Handled { entry_id, .. }) => {
                    debug!(stream = %self.stream, entry_id = %entry_id, "Event handled");
                }
                Ok(Step::Idle) => {
                    tracing::trace!(stream = %self.stream, "No events available");
                }
                Ok(Step::Stopped) => break,
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "Failed to read from event source");
                    tokio::select! {
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                        _ = self.shutdown.requested() => break,
                    }
                }
            }
        }
        info!(stream = %self.stream, "Consumer loop stopped");
    }

    /// Read and handle at most one event.
    pub async fn process_next(&mut self) -> Result<Step, QueueError> {
        if self.shutdown.is_requested() {
            return Ok(Step::Stopped);
        }

        let entry = tokio::select! {
            entry = self.source.next() => entry?,
            _ = self.shutdown.requested() => return Ok(Step::Stopped),
        };

        match entry {
            Some(entry) => Ok(self.handle(entry).await),
            None => Ok(Step::Idle),
        }
    }

    async fn handle(&mut self, entry: StreamEntry) -> Step {
        let started = Instant::now();
        metrics::counter!("moderation_events_total").increment(1);

        let event = RawEvent::parse(&entry.payload);
        let (item_id, outcome) = match event.decode() {
            Ok(request) => {
                info!(
                    stream = %self.stream,
                    entry_id = %entry.id,
                    item_id = request.item_id,
                    timestamp = ?request.timestamp,
                    "Received event"
                );
                let outcome = self.orchestrator.process(request.item_id).await;
                (Some(request.item_id), outcome)
            }
            Err(err) => {
                error!(
                    stream = %self.stream,
                    entry_id = %entry.id,
                    error = %err,
                    "Permanent error processing message"
                );
                (event.item_id(), Outcome::TerminalFailure(TerminalFailure::permanent(err)))
            }
        };

        let disposition = match outcome {
            Outcome::Success { .. } => Disposition::Succeeded,
            Outcome::TerminalFailure(failure) => {
                metrics::counter!("moderation_tasks_failed").increment(1);
                self.dead_letters
                    .publish(
                        item_id,
                        &failure.error,
                        &event,
                        failure.retry_count,
                        failure.permanent,
                    )
                    .await;
                Disposition::DeadLettered {
                    permanent: failure.permanent,
                    retry_count: failure.retry_count,
                }
            }
            Outcome::Abandoned => {
                warn!(
                    stream = %self.stream,
                    entry_id = %entry.id,
                    "Event abandoned on shutdown, left uncommitted for redelivery"
                );
                return Step::Stopped;
            }
        };

        self.commit(&entry.id).await;
        metrics::histogram!("moderation_processing_seconds")
            .record(started.elapsed().as_secs_f64());

        Step::Handled {
            entry_id: entry.id,
            disposition,
        }
    }

    /// Commit failures are logged; the entry will simply be redelivered.
    async fn commit(&mut self, entry_id: &str) {
        if let Err(e) = self.source.commit(entry_id).await {
            error!(
                stream = %self.stream,
                entry_id = %entry_id,
                error = %e,
                "Failed to commit read position"
            );
        }
    }
}
