//! Shared wiring for consumer tests: in-memory store, source and DLQ sink.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use moderation_worker::{
    models::item::Item,
    services::{
        backoff::RetryPolicy,
        consumer::ConsumerLoop,
        dead_letter::DeadLetterPublisher,
        orchestrator::RetryOrchestrator,
        prediction::{LogisticModel, ModelHandle, PredictionExecutor},
        queue::{InMemoryDeadLetterSink, InMemoryEventSource},
        shutdown::{self, Shutdown, ShutdownTrigger},
        store::InMemoryStore,
    },
};

pub const TOPIC: &str = "moderation";
pub const MAX_RETRIES: u32 = 3;

pub fn policy() -> RetryPolicy {
    RetryPolicy::new(MAX_RETRIES, Duration::from_secs(3))
}

/// A listing the reference model accepts (plenty of images).
pub fn clean_item(id: i64) -> Item {
    Item {
        id,
        name: "Ceramic Pour-Over Kettle".to_string(),
        description: "Gooseneck kettle with a built-in thermometer, 1L".to_string(),
        category: 12,
        images_qty: 5,
        is_verified_seller: false,
    }
}

/// A listing the reference model flags (unverified seller, no images).
pub fn suspicious_item(id: i64) -> Item {
    Item {
        images_qty: 0,
        ..clean_item(id)
    }
}

pub fn reference_model() -> Option<ModelHandle> {
    Some(Arc::new(LogisticModel::reference()))
}

/// Everything a consumer test needs to drive and inspect one stream.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub source: InMemoryEventSource,
    pub sink: InMemoryDeadLetterSink,
    pub trigger: ShutdownTrigger,
    pub consumer: ConsumerLoop<InMemoryEventSource>,
}

impl Harness {
    pub fn new(model: Option<ModelHandle>) -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), model)
    }

    pub fn with_store(store: Arc<InMemoryStore>, model: Option<ModelHandle>) -> Self {
        Self::on_stream(TOPIC, store, model)
    }

    /// Consumer for partition `index` of `TOPIC`, wired like the worker binary.
    pub fn partition(
        index: usize,
        store: Arc<InMemoryStore>,
        model: Option<ModelHandle>,
    ) -> Self {
        Self::on_stream(&format!("{}:{}", TOPIC, index), store, model)
    }

    fn on_stream(stream: &str, store: Arc<InMemoryStore>, model: Option<ModelHandle>) -> Self {
        let source = InMemoryEventSource::new();
        let sink = InMemoryDeadLetterSink::new();
        let (trigger, shutdown) = shutdown::channel();
        let consumer = build_consumer(stream, &store, &source, &sink, model, shutdown);
        Self {
            store,
            source,
            sink,
            trigger,
            consumer,
        }
    }
}

pub fn build_consumer(
    stream: &str,
    store: &Arc<InMemoryStore>,
    source: &InMemoryEventSource,
    sink: &InMemoryDeadLetterSink,
    model: Option<ModelHandle>,
    shutdown: Shutdown,
) -> ConsumerLoop<InMemoryEventSource> {
    let orchestrator = RetryOrchestrator::new(
        store.clone(),
        store.clone(),
        PredictionExecutor::new(model),
        policy(),
    )
    .with_shutdown(shutdown.clone());
    let dead_letters = DeadLetterPublisher::new(Arc::new(sink.clone()), TOPIC, MAX_RETRIES);
    ConsumerLoop::new(stream, source.clone(), orchestrator, dead_letters, shutdown)
}
