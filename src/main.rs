use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use star_dispatch::config::{DispatchConfig, ProcessorKind, StoreKind};
use star_dispatch::dispatch::{
    Bootstrapper, ConsumerLoop, DeadLetterSink, EmailNotifier, EventProcessor, FulfilmentProcessor,
    IdempotentProcessor, InMemoryProcessedStore, LogDeadLetterSink, PgDeadLetterSink,
    PgProcessedStore, ProcessedStore, Publisher, Role, TransportClient,
};
use star_dispatch::health::HealthRegistry;
use star_dispatch::messaging::pgmq::redact_url;
use star_dispatch::metrics::{self, Metrics};
use star_dispatch::models::StarAdded;
use star_dispatch::utils::{retry_with_backoff, RetryResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; real deployments use the environment
    let _ = dotenvy::dotenv();

    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,star_dispatch=debug")),
        )
        .init();

    let config = DispatchConfig::from_env()?;
    let transport = config.transport_config();

    tracing::info!(
        role = %config.role,
        substrate = %transport.substrate(),
        endpoint = %transport.endpoint(),
        "🚀 Starting star dispatch"
    );

    // === 1. Metrics and health ===
    let metrics = Arc::new(Metrics::new()?);
    let health = Arc::new(HealthRegistry::new());

    if config.metrics_port != 0 {
        let registry = Arc::new(metrics.registry().clone());
        let health = health.clone();
        let port = config.metrics_port;
        std::thread::spawn(move || {
            let result = actix_web::rt::System::new()
                .block_on(metrics::start_metrics_server(registry, health, port));
            if let Err(e) = result {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    // === 2. Connect and provision (fatal once the retry budget is spent) ===
    let client = Bootstrapper::new(config.bootstrap.clone())
        .with_metrics(metrics.clone())
        .connect(&transport, config.role)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "💥 Transport bootstrap failed"))?;

    match config.role {
        Role::Publisher => run_publisher(&config, &client, metrics, health).await,
        Role::Consumer => run_consumer(&config, &client, metrics, health).await,
    }
}

/// Publish every `StarAdded` JSON line read from stdin
async fn run_publisher(
    config: &DispatchConfig,
    client: &TransportClient,
    metrics: Arc<Metrics>,
    health: Arc<HealthRegistry>,
) -> anyhow::Result<()> {
    let publisher = Publisher::new(client.sink()?, config.publisher_config())
        .with_metrics(metrics)
        .with_health(health);

    tracing::info!("📥 Reading StarAdded events from stdin, one JSON object per line");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event = match StarAdded::from_payload(line.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "Skipping malformed input line");
                continue;
            }
        };

        if publisher.notify(&event).await.is_some() {
            published += 1;
        }
    }

    tracing::info!(published, "🎉 Input exhausted, publisher stopping");

    // The push socket still holds messages handed to its workers' channels
    client.close(config.shutdown_linger).await?;
    Ok(())
}

async fn run_consumer(
    config: &DispatchConfig,
    client: &TransportClient,
    metrics: Arc<Metrics>,
    health: Arc<HealthRegistry>,
) -> anyhow::Result<()> {
    let source = client.source().await?;

    let pool = if config.needs_postgres() {
        Some(postgres_pool(config, client).await?)
    } else {
        None
    };

    let processed: Arc<dyn ProcessedStore> = match (&config.processed_store, &pool) {
        (StoreKind::Postgres, Some(pool)) => {
            let store = PgProcessedStore::new(pool.clone());
            store.ensure_schema().await?;
            Arc::new(store)
        }
        _ => Arc::new(InMemoryProcessedStore::new()),
    };

    let dead_letters: Arc<dyn DeadLetterSink> = match (&config.dead_letter_store, &pool) {
        (StoreKind::Postgres, Some(pool)) => {
            let sink = PgDeadLetterSink::new(pool.clone());
            sink.ensure_schema().await?;
            report_dead_letters(&sink).await;
            Arc::new(sink)
        }
        _ => Arc::new(LogDeadLetterSink),
    };

    let processor: Arc<dyn EventProcessor> = match config.processor {
        ProcessorKind::Email => Arc::new(IdempotentProcessor::new(EmailNotifier::default(), processed)),
        ProcessorKind::Fulfilment => {
            Arc::new(IdempotentProcessor::new(FulfilmentProcessor::default(), processed))
        }
    };
    tracing::info!(
        service = config.processor.service_name(),
        queue = %config.queue,
        "📬 Consumer processor selected"
    );
    let consumer = ConsumerLoop::new(source, processor, dead_letters, config.consumer_config())
        .with_metrics(metrics)
        .with_health(health);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        tracing::info!("🛑 Shutdown requested, finishing in-flight message");
        let _ = shutdown_tx.send(true);
    });

    let stats = consumer.run(shutdown_rx).await;
    tracing::info!(
        received = stats.received,
        acked = stats.acked,
        dead_lettered = stats.dead_lettered,
        "👋 Consumer stopped"
    );
    Ok(())
}

/// Startup summary of what earlier runs left in the dead-letter table
async fn report_dead_letters(sink: &PgDeadLetterSink) {
    let stats = match sink.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read dead-letter statistics");
            return;
        }
    };

    if stats.total_messages == 0 {
        tracing::info!("📭 Dead-letter table is empty");
        return;
    }

    tracing::warn!(
        total = stats.total_messages,
        by_reason = ?stats.by_reason,
        "📬 Dead-letter table holds messages awaiting inspection"
    );
    match sink.list(5).await {
        Ok(letters) => {
            for letter in letters {
                tracing::warn!(
                    id = %letter.id,
                    substrate = %letter.substrate,
                    reason = letter.reason.as_str(),
                    error = %letter.error_message,
                    dead_lettered_at = %letter.dead_lettered_at,
                    "Recent dead letter"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not list recent dead letters"),
    }
}

/// Reuse the transport's pool on the polling table, otherwise open one
async fn postgres_pool(config: &DispatchConfig, client: &TransportClient) -> anyhow::Result<PgPool> {
    if let Some(pool) = client.pg_pool() {
        return Ok(pool);
    }

    let url = config.database_url.clone();
    tracing::info!(endpoint = %redact_url(&url), "Connecting to PostgreSQL for consumer stores");

    match retry_with_backoff("postgres_stores", config.bootstrap.clone(), |_| {
        let url = url.clone();
        async move { PgPoolOptions::new().max_connections(5).connect(&url).await }
    })
    .await
    {
        RetryResult::Success(pool) => Ok(pool),
        RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
            Err(anyhow::anyhow!("PostgreSQL unavailable for consumer stores: {}", e))
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
