// This is the entry point of the moderation pipeline.
//
// **Architecture Overview:**
// - `core/` = Coordination and delivery logic (rate limiter, lock, producer, consumer)
// - `infra/` = Implementations of core traits (Redis/SQLite/in-memory store, brokers)
// - `pipeline/` = The hosting process side (ingest, moderation worker, lag monitor)
//
// This file's job is to:
// 1. Load configuration
// 2. Build and connect the store and broker clients (dependency injection)
// 3. Wire the worker, consumer loop and lag monitor together
// 4. Shut everything down in order on Ctrl-C

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
mod config;
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;
#[path = "pipeline/pipeline_layer.rs"]
mod pipeline;

use crate::config::{AppConfig, BrokerBackend, BrokerConfig, StoreBackend, StoreConfig};
use crate::core::messaging::{BrokerConsumer, BrokerProducer, Consumer, DeadLetterRouter, Producer};
use crate::core::store::SharedStore;
use crate::infra::broker::InMemoryBroker;
use crate::infra::store::{InMemoryStore, RedisStore, SqliteSharedStore};
use crate::pipeline::{
    BlocklistClassifier, ContentSubmission, IngestGate, IngestOutcome, LagMonitor, ModerationWorker,
};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use std::io::BufRead;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

const SQLITE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn build_store(
    config: &StoreConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Arc<dyn SharedStore>> {
    let store: Arc<dyn SharedStore> = match config.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::new(&config.redis_url, config.key_prefix.clone(), config.connect_timeout)
                .context("Invalid REDIS_URL")?,
        ),
        StoreBackend::Sqlite => {
            let store = Arc::new(SqliteSharedStore::new(
                config.sqlite_path.clone(),
                config.key_prefix.clone(),
                config.connect_timeout,
            ));
            tokio::spawn(purge_expired_rows(Arc::clone(&store), shutdown));
            store
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; rate limits and locks are per-process only");
            Arc::new(InMemoryStore::with_prefix(config.key_prefix.clone()))
        }
    };
    Ok(store)
}

/// SQLite keeps expired rows until something deletes them.
async fn purge_expired_rows(store: Arc<SqliteSharedStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SQLITE_PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(rows = n, "Purged expired store rows"),
                Err(e) => tracing::debug!(error = %e, "Store purge skipped"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

fn build_broker(
    config: &BrokerConfig,
) -> anyhow::Result<(Arc<dyn BrokerProducer>, Arc<dyn BrokerConsumer>)> {
    match config.backend {
        BrokerBackend::Memory => {
            tracing::warn!("Using the in-memory broker; messages never leave this process");
            let broker = InMemoryBroker::new(config.partitions);
            Ok((
                Arc::new(broker.producer()),
                Arc::new(broker.consumer(config.group_id.clone())),
            ))
        }
        #[cfg(feature = "kafka")]
        BrokerBackend::Kafka => {
            use crate::infra::broker::{KafkaConsumerClient, KafkaProducerClient, KafkaSettings};
            let settings = KafkaSettings {
                brokers: config.brokers.clone(),
                client_id: config.client_id.clone(),
                group_id: config.group_id.clone(),
                request_timeout: config.connect_timeout,
            };
            Ok((
                Arc::new(KafkaProducerClient::new(settings.clone())),
                Arc::new(KafkaConsumerClient::new(settings)),
            ))
        }
        #[cfg(not(feature = "kafka"))]
        BrokerBackend::Kafka => {
            anyhow::bail!("BROKER_BACKEND=kafka needs a build with `--features kafka`")
        }
    }
}

/// Read lines on a plain OS thread.
///
/// A blocked stdin read cannot be cancelled. On a detached thread it does not
/// hold up runtime shutdown the way a `spawn_blocking` reader would.
fn spawn_line_reader<R: BufRead + Send + 'static>(reader: R) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read ingest input");
                    break;
                }
            }
        }
    });
    rx
}

/// Dev ingest: one `<user_id> <text>` submission per line.
async fn ingest_lines(
    gate: Arc<IngestGate>,
    mut lines: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = shutdown.changed() => break,
        };
        // None: the input reached EOF
        let Some(line) = line else {
            break;
        };

        let Some(submission) = ContentSubmission::from_line(&line) else {
            tracing::warn!("Expected `<user_id> <text>`");
            continue;
        };
        match gate.submit(&submission).await {
            Ok(IngestOutcome::Accepted(receipt)) => tracing::info!(
                content_id = %submission.content_id,
                partition = receipt.partition,
                offset = receipt.offset,
                "Submission accepted"
            ),
            Ok(IngestOutcome::RateLimited) => {}
            Err(e) => tracing::error!(error = %e, "Submission could not be published"),
        }
    }
    tracing::info!("Line ingest stopped");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Initialize logging so we can see what's happening (RUST_LOG, default info)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Connection failures here are fatal: the process does not start without
    // its store and broker.

    let store = build_store(&config.store, shutdown_rx.clone())?;
    store
        .connect()
        .await
        .context("Could not connect to the shared store")?;

    let (producer_client, consumer_client) = build_broker(&config.broker)?;

    let producer = Arc::new(
        Producer::new(
            producer_client,
            config.retry.clone(),
            config.topics.dead_letter.clone(),
        )
        .with_connect_timeout(config.broker.connect_timeout),
    );
    producer
        .connect()
        .await
        .context("Could not connect the producer")?;

    let consumer = Arc::new(
        Consumer::new(consumer_client, DeadLetterRouter::new(producer.clone()))
            .with_connect_timeout(config.broker.connect_timeout)
            .with_poll_timeout(config.broker.poll_timeout),
    );
    consumer
        .connect()
        .await
        .context("Could not connect the consumer")?;

    let classifier = Arc::new(BlocklistClassifier::new(config.blocked_terms.clone()));
    let worker = Arc::new(ModerationWorker::new(
        classifier,
        producer.clone(),
        config.topics.clone(),
    ));
    consumer
        .subscribe(&config.topics.raw_content, worker)
        .await
        .context("Could not subscribe to raw content")?;

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    let mut consuming = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.start_consuming().await })
    };

    let monitoring = {
        let monitor = LagMonitor::new(
            Arc::clone(&store),
            Arc::clone(&consumer),
            config.lag_monitor.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(shutdown).await })
    };

    let ingesting = if config.ingest.stdin_enabled {
        let gate = Arc::new(IngestGate::new(
            Arc::clone(&store),
            producer.clone(),
            config.topics.raw_content.clone(),
            config.ingest.max_tokens,
            config.ingest.refill_per_sec,
        ));
        tracing::info!("Reading submissions from stdin");
        let lines = spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
        Some(tokio::spawn(ingest_lines(gate, lines, shutdown_rx.clone())))
    } else {
        None
    };

    tracing::info!(
        topics = ?consumer.topics(),
        dead_letter = %config.topics.dead_letter,
        "Moderation pipeline running"
    );

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    let consumer_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            consumer.stop_consuming();
            (&mut consuming).await
        }
        result = &mut consuming => {
            tracing::error!("Consumer exited on its own; shutting down");
            result
        }
    };
    match consumer_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Consumer ended with an error"),
        Err(e) => tracing::error!(error = %e, "Consumer task failed"),
    }

    shutdown_tx.send_replace(true);
    if let Err(e) = monitoring.await {
        tracing::warn!(error = %e, "Lag monitor task failed");
    }
    if let Some(ingesting) = ingesting {
        if let Err(e) = ingesting.await {
            tracing::warn!(error = %e, "Ingest task failed");
        }
    }

    if let Err(e) = producer.disconnect().await {
        tracing::warn!(error = %e, "Producer disconnect failed");
    }
    if let Err(e) = store.disconnect().await {
        tracing::warn!(error = %e, "Store disconnect failed");
    }

    tracing::info!("Moderation pipeline stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messaging::RetryPolicy;
    use std::io::{BufReader, Cursor, Read};

    /// Input whose reads never return, like an idle terminal.
    struct SilentInput;

    impl Read for SilentInput {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                std::thread::park();
            }
        }
    }

    async fn gate(broker: &InMemoryBroker) -> Arc<IngestGate> {
        let client: Arc<dyn BrokerProducer> = Arc::new(broker.producer());
        let producer = Arc::new(Producer::new(client, RetryPolicy::default(), "dead-letter"));
        producer.connect().await.unwrap();
        Arc::new(IngestGate::new(
            Arc::new(InMemoryStore::new()),
            producer,
            "raw-content",
            10,
            1.0,
        ))
    }

    #[tokio::test]
    async fn test_ingest_submits_each_valid_line() {
        let broker = InMemoryBroker::new(1);
        let lines = spawn_line_reader(Cursor::new("u1 hello\nnot-a-submission\nu2 hi there\n"));
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(2), ingest_lines(gate(&broker).await, lines, rx))
            .await
            .unwrap();

        assert_eq!(broker.records("raw-content").len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_a_blocked_read() {
        let broker = InMemoryBroker::new(1);
        let lines = spawn_line_reader(BufReader::new(SilentInput));
        let (tx, rx) = watch::channel(false);

        let ingest = tokio::spawn(ingest_lines(gate(&broker).await, lines, rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), ingest)
            .await
            .expect("ingest kept waiting on its input")
            .unwrap();
    }
}
