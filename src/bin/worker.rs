use moderation_worker::{
    app_state::AppState,
    config::WorkerConfig,
    db::{self, queries::PgStore},
    routes,
    services::{
        backoff::RetryPolicy,
        consumer::ConsumerLoop,
        dead_letter::DeadLetterPublisher,
        orchestrator::RetryOrchestrator,
        prediction::{
            FallbackModelLoader, HttpModelLoader, ModelLoader, ModelStatus, PredictionExecutor,
        },
        queue::RedisStreams,
        shutdown::{self, ShutdownTrigger},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting moderation worker");

    // Load configuration
    let config = WorkerConfig::from_env().expect("Failed to load configuration");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let store = Arc::new(PgStore::new(db_pool.clone()));

    // Load the model once; streams reload on demand if this fails
    let backend = config
        .model_backend_url
        .clone()
        .map(|url| HttpModelLoader::new(url, config.model_timeout()))
        .transpose()
        .expect("Failed to build model backend client");
    let loader: Arc<dyn ModelLoader> = Arc::new(FallbackModelLoader::new(
        backend,
        config.reference_model_fallback,
    ));
    let model = match loader.load().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load model, events will be retried");
            None
        }
    };
    let model_status = ModelStatus::new(model.is_some());

    tracing::info!(redis_url = %config.redis_url, "Connecting to Redis Streams");
    let streams = RedisStreams::new(&config.redis_url).expect("Failed to initialize Redis client");

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(wait_for_signal(trigger));

    let policy = RetryPolicy::new(config.max_retries, config.base_delay());
    let stream_keys = config.stream_keys();
    let mut joins = Vec::with_capacity(stream_keys.len());

    for (partition, stream_key) in stream_keys.iter().enumerate() {
        let consumer_name = if stream_keys.len() > 1 {
            format!("{}-{}", config.consumer_name, partition)
        } else {
            config.consumer_name.clone()
        };

        let source = streams
            .source(
                stream_key,
                &config.consumer_group,
                &consumer_name,
                Duration::from_millis(config.read_block_ms),
            )
            .await
            .expect("Failed to open event stream");

        let sink = streams
            .dead_letter_sink(&config.dlq_topic)
            .await
            .expect("Failed to open dead-letter stream");

        let orchestrator = RetryOrchestrator::new(
            store.clone(),
            store.clone(),
            PredictionExecutor::new(model.clone()),
            policy,
        )
        .with_loader(loader.clone())
        .with_model_status(model_status.clone())
        .with_shutdown(shutdown.clone());

        // Payloads name the configured topic, not the partition key.
        let dead_letters =
            DeadLetterPublisher::new(Arc::new(sink), config.topic.clone(), policy.max_retries);

        tracing::info!(
            stream = %stream_key,
            group = %config.consumer_group,
            consumer = %consumer_name,
            "Started consuming"
        );

        let consumer = ConsumerLoop::new(
            stream_key.clone(),
            source,
            orchestrator,
            dead_letters,
            shutdown.clone(),
        );
        joins.push(tokio::spawn(consumer.run()));
    }

    // Admin endpoints
    let state = AppState::new(
        db_pool,
        streams,
        prometheus_handle,
        model_status,
        stream_keys,
    );
    let app = routes::admin_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind admin address");
    tracing::info!("Admin endpoints listening on {}", config.bind_addr);

    let mut admin_shutdown = shutdown.clone();
    let admin = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { admin_shutdown.requested().await })
            .await
        {
            tracing::error!(error = %e, "Admin server error");
        }
    });

    for join in joins {
        if let Err(e) = join.await {
            tracing::error!(error = %e, "Consumer task panicked");
        }
    }
    if let Err(e) = admin.await {
        tracing::error!(error = %e, "Admin server task panicked");
    }

    tracing::info!("Moderation worker stopped");
}

fn describe_metrics() {
    metrics::describe_counter!(
        "moderation_events_total",
        "Events read from the moderation stream"
    );
    metrics::describe_counter!("moderation_tasks_completed", "Moderation tasks completed");
    metrics::describe_counter!(
        "moderation_tasks_failed",
        "Events that ended in a terminal failure"
    );
    metrics::describe_counter!("moderation_retries_total", "Retry attempts scheduled");
    metrics::describe_counter!("moderation_dead_letters_total", "Payloads sent to the DLQ");
    metrics::describe_counter!(
        "moderation_dead_letter_errors_total",
        "Dead-letter emissions that failed"
    );
    metrics::describe_histogram!(
        "moderation_processing_seconds",
        "Time from reading an event to committing it"
    );
    metrics::describe_gauge!(
        "moderation_stream_length",
        "Entries held in a moderation stream"
    );
}

/// Flip the shutdown signal on Ctrl-C or SIGTERM.
async fn wait_for_signal(trigger: ShutdownTrigger) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown requested, finishing in-flight work");
    let _ = trigger.send(true);
    // Hold the sender until every consumer has observed the signal.
    trigger.closed().await;
}
