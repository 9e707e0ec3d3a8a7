//! Drives a single moderation request to a terminal outcome.
//!
//! One attempt = load item, load latest pending task, predict, write the
//! completed task. Retryable failures are retried up to `max_retries` times
//! with exponential backoff; permanent failures stop immediately. Both kinds
//! of terminal failure get a best-effort `failed` write before returning.

use std::sync::Arc;

use garde::Validate;
use tracing::{error, info, warn};

use crate::models::task::TaskUpdate;
use crate::services::backoff::RetryPolicy;
use crate::services::errors::{classify, ErrorClass, ProcessingError};
use crate::services::prediction::{ModelLoader, ModelStatus, PredictionExecutor};
use crate::services::shutdown::Shutdown;
use crate::services::store::{ItemRepository, TaskStore};

/// Result of one attempt, tagged by how the orchestrator must react.
#[derive(Debug)]
pub enum AttemptResult {
    /// Task completed (`Some(task_id)`), or nothing was pending.
    Success(Option<i64>),
    Retryable(ProcessingError),
    Permanent(ProcessingError),
}

impl From<Result<Option<i64>, ProcessingError>> for AttemptResult {
    fn from(result: Result<Option<i64>, ProcessingError>) -> Self {
        match result {
            Ok(task_id) => AttemptResult::Success(task_id),
            Err(e) => match classify(&e) {
                ErrorClass::Retryable => AttemptResult::Retryable(e),
                ErrorClass::Permanent => AttemptResult::Permanent(e),
            },
        }
    }
}

/// Why processing stopped without success.
#[derive(Debug)]
pub struct TerminalFailure {
    /// The final error (the permanent one, or the last retryable one).
    pub error: ProcessingError,
    /// Message recorded on the task.
    pub message: String,
    /// Retries used; always 0 for permanent failures.
    pub retry_count: u32,
    pub permanent: bool,
}

impl TerminalFailure {
    pub fn permanent(error: ProcessingError) -> Self {
        Self {
            message: format!("Permanent error: {}", error),
            error,
            retry_count: 0,
            permanent: true,
        }
    }

    pub fn exhausted(error: ProcessingError, retry_count: u32) -> Self {
        Self {
            message: format!("Max retries exceeded. Last error: {}", error),
            error,
            retry_count,
            permanent: false,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// Task completed (`Some(task_id)`) or nothing was pending for the item.
    Success { task_id: Option<i64> },
    TerminalFailure(TerminalFailure),
    /// Shutdown arrived during a backoff delay. The event stays uncommitted.
    Abandoned,
}

pub struct RetryOrchestrator {
    items: Arc<dyn ItemRepository>,
    tasks: Arc<dyn TaskStore>,
    executor: PredictionExecutor,
    loader: Option<Arc<dyn ModelLoader>>,
    model_status: ModelStatus,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl RetryOrchestrator {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        tasks: Arc<dyn TaskStore>,
        executor: PredictionExecutor,
        policy: RetryPolicy,
    ) -> Self {
        let model_status = ModelStatus::new(executor.is_loaded());
        Self {
            items,
            tasks,
            executor,
            loader: None,
            model_status,
            policy,
            shutdown: Shutdown::never(),
        }
    }

    /// Reload the model through `loader` whenever no handle is present.
    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Report reloads through a status shared with the health check.
    pub fn with_model_status(mut self, status: ModelStatus) -> Self {
        if self.executor.is_loaded() {
            status.set_loaded(true);
        }
        self.model_status = status;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Process one request until success, a permanent failure, or exhaustion.
    pub async fn process(&mut self, item_id: i64) -> Outcome {
        let mut attempt: u32 = 0;

        let last_error = loop {
            match self.attempt(item_id).await {
                AttemptResult::Success(task_id) => return Outcome::Success { task_id },
                AttemptResult::Permanent(err) => {
                    error!(item_id, attempt, error = %err, "Permanent error, skipping retries");
                    let failure = TerminalFailure::permanent(err);
                    self.mark_failed(item_id, TaskUpdate::failed(&failure.message, None))
                        .await;
                    return Outcome::TerminalFailure(failure);
                }
                AttemptResult::Retryable(err) => {
                    if attempt >= self.policy.max_retries {
                        error!(
                            item_id,
                            max_retries = self.policy.max_retries,
                            error = %err,
                            "Max retries exceeded"
                        );
                        break err;
                    }

                    let delay = self.policy.delay(attempt);
                    warn!(
                        item_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable error, backing off"
                    );
                    self.bump_retry_count(item_id).await;
                    metrics::counter!("moderation_retries_total").increment(1);

                    if !self.backoff(delay).await {
                        info!(item_id, attempt, "Shutdown during backoff, abandoning event");
                        return Outcome::Abandoned;
                    }
                    attempt += 1;
                }
            }
        };

        let failure = TerminalFailure::exhausted(last_error, attempt);
        self.mark_failed(
            item_id,
            TaskUpdate::failed(&failure.message, Some(attempt as i32)),
        )
        .await;
        Outcome::TerminalFailure(failure)
    }

    /// Run a single attempt and tag its result.
    pub async fn attempt(&mut self, item_id: i64) -> AttemptResult {
        self.run_attempt(item_id).await.into()
    }

    async fn run_attempt(&mut self, item_id: i64) -> Result<Option<i64>, ProcessingError> {
        let item = self
            .items
            .get_item(item_id)
            .await?
            .ok_or(ProcessingError::ItemNotFound(item_id))?;

        item.validate()
            .map_err(|report| ProcessingError::InvalidItem {
                item_id,
                reason: report.to_string(),
            })?;

        let Some(task) = self.tasks.get_latest_pending(item_id).await? else {
            info!(item_id, "No pending moderation task, nothing to do");
            return Ok(None);
        };

        self.ensure_model().await;
        let prediction = self.executor.predict(&item)?;

        self.tasks
            .update_task(
                task.id,
                &TaskUpdate::completed(prediction.is_violation, prediction.probability),
            )
            .await?;

        metrics::counter!("moderation_tasks_completed").increment(1);
        info!(
            item_id,
            task_id = task.id,
            is_violation = prediction.is_violation,
            probability = prediction.probability,
            "Moderation task completed"
        );

        Ok(Some(task.id))
    }

    /// Swap in a freshly loaded handle if none is present. Failures leave the
    /// executor empty, which the attempt reports as a retryable error.
    async fn ensure_model(&mut self) {
        if self.executor.is_loaded() {
            return;
        }
        let Some(loader) = self.loader.clone() else {
            return;
        };
        // Shutdown cuts a reload short; the attempt then fails as retryable
        // and the backoff that follows abandons the event.
        let loaded = tokio::select! {
            loaded = loader.load() => loaded,
            _ = self.shutdown.requested() => {
                info!("Shutdown during model reload");
                return;
            }
        };
        match loaded {
            Ok(handle) => {
                info!("Model handle reloaded");
                self.executor = PredictionExecutor::new(Some(handle));
                self.model_status.set_loaded(true);
            }
            Err(e) => warn!(error = %e, "Model reload failed"),
        }
    }

    async fn bump_retry_count(&self, item_id: i64) {
        let task = match self.tasks.get_latest_pending(item_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(item_id, error = %e, "Failed to increment retry count");
                return;
            }
        };

        match self.tasks.increment_retry_count(task.id).await {
            Ok(count) => info!(item_id, task_id = task.id, retry_count = ?count, "Retry count bumped"),
            Err(e) => warn!(item_id, task_id = task.id, error = %e, "Failed to increment retry count"),
        }
    }

    async fn mark_failed(&self, item_id: i64, update: TaskUpdate) {
        let task = match self.tasks.get_latest_pending(item_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(item_id, "No pending moderation task found to mark failed");
                return;
            }
            Err(e) => {
                error!(item_id, error = %e, "Failed to update moderation status");
                return;
            }
        };

        if let Err(e) = self.tasks.update_task(task.id, &update).await {
            error!(item_id, task_id = task.id, error = %e, "Failed to update moderation status");
        }
    }

    /// Sleep for `delay` unless shutdown is requested first. Returns `false`
    /// when interrupted.
    async fn backoff(&mut self, delay: std::time::Duration) -> bool {
        if self.shutdown.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.requested() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::item::Item;
    use crate::models::task::TaskStatus;
    use crate::services::prediction::{LogisticModel, ModelHandle, PredictionError};
    use crate::services::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` loads, then serves the reference model.
    struct FlakyLoader {
        calls: AtomicUsize,
        failures: usize,
    }

    impl FlakyLoader {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelLoader for FlakyLoader {
        async fn load(&self) -> Result<ModelHandle, PredictionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(PredictionError::NotConfigured);
            }
            Ok(Arc::new(LogisticModel::reference()))
        }
    }

    fn item(id: i64) -> Item {
        Item {
            id,
            name: "Yoga Mat Grip 6mm".to_string(),
            description: "Non-slip yoga mat with dense cushioning".to_string(),
            category: 4,
            images_qty: 4,
            is_verified_seller: false,
        }
    }

    fn orchestrator(store: &Arc<InMemoryStore>, loaded: bool) -> RetryOrchestrator {
        let model = loaded.then(|| {
            Arc::new(LogisticModel::reference()) as crate::services::prediction::ModelHandle
        });
        RetryOrchestrator::new(
            store.clone(),
            store.clone(),
            PredictionExecutor::new(model),
            RetryPolicy::new(3, Duration::from_secs(3)),
        )
    }

    #[test]
    fn test_attempt_result_tagging() {
        assert!(matches!(
            AttemptResult::from(Ok(Some(1))),
            AttemptResult::Success(Some(1))
        ));
        assert!(matches!(
            AttemptResult::from(Err(ProcessingError::ItemNotFound(1))),
            AttemptResult::Permanent(_)
        ));
        assert!(matches!(
            AttemptResult::from(Err(ProcessingError::ModelUnavailable)),
            AttemptResult::Retryable(_)
        ));
    }

    #[test]
    fn test_terminal_failure_messages() {
        let permanent = TerminalFailure::permanent(ProcessingError::ItemNotFound(5));
        assert_eq!(
            permanent.message,
            "Permanent error: Item with id=5 not found in database"
        );
        assert_eq!(permanent.retry_count, 0);

        let exhausted = TerminalFailure::exhausted(ProcessingError::ModelUnavailable, 3);
        assert_eq!(
            exhausted.message,
            "Max retries exceeded. Last error: ML model is not available"
        );
        assert!(!exhausted.permanent);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_item(item(1));
        let task_id = store.create_task(1);

        let outcome = orchestrator(&store, true).process(1).await;
        assert!(matches!(outcome, Outcome::Success { task_id: Some(id) } if id == task_id));

        let task = store.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.is_violation, Some(false));
        assert!(task.probability.is_some());
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_no_pending_task_is_a_no_op_success() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_item(item(1));

        let outcome = orchestrator(&store, true).process(1).await;
        assert!(matches!(outcome, Outcome::Success { task_id: None }));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_item_fails_permanently() {
        let store = Arc::new(InMemoryStore::new());
        let mut bad = item(1);
        bad.description = String::new();
        store.insert_item(bad);
        let task_id = store.create_task(1);

        let outcome = orchestrator(&store, true).process(1).await;
        let Outcome::TerminalFailure(failure) = outcome else {
            panic!("expected terminal failure");
        };
        assert!(failure.permanent);
        assert!(matches!(failure.error, ProcessingError::InvalidItem { .. }));
        assert_eq!(store.task(task_id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_store_outage() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_item(item(1));
        let task_id = store.create_task(1);
        store.set_unavailable(true);

        let mut orchestrator = orchestrator(&store, true);
        let handle = tokio::spawn({
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                store.set_unavailable(false);
            }
        });

        let outcome = orchestrator.process(1).await;
        handle.await.unwrap();
        assert!(matches!(outcome, Outcome::Success { task_id: Some(_) }));

        let task = store.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        // The bump attempted during the outage is lost.
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_abandons() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_item(item(1));
        let task_id = store.create_task(1);
        let (trigger, shutdown) = crate::services::shutdown::channel();

        let mut orchestrator = orchestrator(&store, false).with_shutdown(shutdown);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = trigger.send(true);
        });

        let started = tokio::time::Instant::now();
        let outcome = orchestrator.process(1).await;
        assert!(matches!(outcome, Outcome::Abandoned));
        assert!(started.elapsed() < Duration::from_secs(3));

        let task = store.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_reload_recovers_on_next_attempt() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_item(item(1));
        let task_id = store.create_task(1);
        let loader = FlakyLoader::new(1);
        let status = ModelStatus::new(false);

        let mut orchestrator = orchestrator(&store, false)
            .with_loader(loader.clone())
            .with_model_status(status.clone());
        assert!(!status.is_loaded());

        let outcome = orchestrator.process(1).await;
        assert!(matches!(outcome, Outcome::Success { task_id: Some(id) } if id == task_id));
        assert_eq!(loader.calls(), 2);
        assert!(status.is_loaded());

        let task = store.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_failing_every_time_exhausts_retries() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_item(item(1));
        let task_id = store.create_task(1);
        let loader = FlakyLoader::new(usize::MAX);
        let status = ModelStatus::new(false);

        let mut orchestrator = orchestrator(&store, false)
            .with_loader(loader.clone())
            .with_model_status(status.clone());

        let Outcome::TerminalFailure(failure) = orchestrator.process(1).await else {
            panic!("expected terminal failure");
        };
        assert!(!failure.permanent);
        assert!(matches!(failure.error, ProcessingError::ModelUnavailable));
        assert_eq!(failure.retry_count, 3);
        assert_eq!(loader.calls(), 4);
        assert!(!status.is_loaded());

        let task = store.task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
    }

    #[tokio::test]
    async fn test_loaded_executor_marks_status_loaded() {
        let store = Arc::new(InMemoryStore::new());
        let status = ModelStatus::new(false);
        let _orchestrator = orchestrator(&store, true).with_model_status(status.clone());
        assert!(status.is_loaded());
    }
}
