// Consumer lag monitor.
//
// Every process runs one, but only the holder of the `consumer-lag-check`
// lock does the check on a given tick. The others skip.

use crate::config::LagMonitorConfig;
use crate::core::lock::DistributedLock;
use crate::core::messaging::{BrokerConsumer, Consumer, PartitionLag};
use crate::core::store::SharedStore;
use std::sync::Arc;
use tokio::sync::watch;

pub const LAG_CHECK_LOCK: &str = "consumer-lag-check";

#[derive(Debug, Clone, PartialEq)]
pub enum LagCheck {
    /// Another process holds the lock (or the store is down).
    Skipped,
    /// Partitions whose lag is above the threshold.
    Checked { behind: Vec<PartitionLag> },
    Failed,
}

pub struct LagMonitor {
    lock: DistributedLock<dyn SharedStore>,
    consumer: Arc<Consumer<dyn BrokerConsumer>>,
    config: LagMonitorConfig,
}

impl LagMonitor {
    pub fn new(
        store: Arc<dyn SharedStore>,
        consumer: Arc<Consumer<dyn BrokerConsumer>>,
        config: LagMonitorConfig,
    ) -> Self {
        Self {
            lock: DistributedLock::new(store),
            consumer,
            config,
        }
    }

    pub async fn check_once(&self) -> LagCheck {
        let outcome = self
            .lock
            .with_lock(LAG_CHECK_LOCK, self.config.lock_ttl_secs, self.inspect())
            .await;

        match outcome {
            Some(check) => check,
            None => {
                tracing::debug!("Lag check lock held elsewhere; skipping");
                LagCheck::Skipped
            }
        }
    }

    async fn inspect(&self) -> LagCheck {
        let lags = match self.consumer.lag().await {
            Ok(lags) => lags,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read consumer lag");
                return LagCheck::Failed;
            }
        };

        let total: i64 = lags.iter().map(PartitionLag::lag).sum();
        let behind: Vec<PartitionLag> = lags
            .into_iter()
            .filter(|p| p.lag() > self.config.warn_threshold)
            .collect();

        for partition in &behind {
            tracing::warn!(
                topic = %partition.topic,
                partition = partition.partition,
                lag = partition.lag(),
                threshold = self.config.warn_threshold,
                "Consumer lag above threshold"
            );
        }
        tracing::info!(total_lag = total, lagging_partitions = behind.len(), "Consumer lag checked");
        LagCheck::Checked { behind }
    }

    /// Check on every interval tick until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Lag monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::LockToken;
    use crate::core::messaging::{
        handler_fn, BrokerProducer, DeadLetterRouter, HandlerError, OutgoingMessage, Producer,
        RetryPolicy,
    };
    use crate::core::store::testing::FlakyStore;
    use crate::infra::broker::InMemoryBroker;
    use crate::infra::store::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn config(threshold: i64) -> LagMonitorConfig {
        LagMonitorConfig {
            interval: Duration::from_millis(10),
            lock_ttl_secs: 5,
            warn_threshold: threshold,
        }
    }

    async fn setup(store: Arc<dyn SharedStore>, backlog: usize, threshold: i64) -> LagMonitor {
        let broker = InMemoryBroker::new(1);
        let client: Arc<dyn BrokerProducer> = Arc::new(broker.producer());
        let producer = Arc::new(Producer::new(client.clone(), RetryPolicy::default(), "dead-letter"));
        producer.connect().await.unwrap();
        for _ in 0..backlog {
            producer
                .publish("raw-content", OutgoingMessage::new(json!({})))
                .await
                .unwrap();
        }

        let consumer_client: Arc<dyn BrokerConsumer> = Arc::new(broker.consumer("g"));
        let consumer = Arc::new(Consumer::new(consumer_client, DeadLetterRouter::new(producer)));
        consumer.connect().await.unwrap();
        consumer
            .subscribe(
                "raw-content",
                handler_fn(|_| async { Ok::<(), HandlerError>(()) }),
            )
            .await
            .unwrap();

        LagMonitor::new(store, consumer, config(threshold))
    }

    #[tokio::test]
    async fn test_reports_partitions_over_threshold_and_releases() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = setup(store.clone(), 5, 3).await;

        match monitor.check_once().await {
            LagCheck::Checked { behind } => {
                assert_eq!(behind.len(), 1);
                assert_eq!(behind[0].lag(), 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!store.exists("lock:consumer-lag-check").await.unwrap());
    }

    #[tokio::test]
    async fn test_skips_when_another_process_holds_the_lock() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = setup(store.clone(), 0, 3).await;

        let other = DistributedLock::new(store.clone());
        let token = LockToken::generate();
        assert!(other.acquire(LAG_CHECK_LOCK, 30, token.as_str()).await);

        assert_eq!(monitor.check_once().await, LagCheck::Skipped);
        // The other holder's lock is untouched
        assert!(other.release(LAG_CHECK_LOCK, token.as_str()).await);
    }

    #[tokio::test]
    async fn test_store_outage_skips_the_check() {
        let store = Arc::new(FlakyStore::new());
        let monitor = setup(store.clone(), 10, 3).await;
        store.go_down();

        assert_eq!(monitor.check_once().await, LagCheck::Skipped);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = Arc::new(setup(store, 0, 3).await);
        let (tx, rx) = watch::channel(false);

        let running = Arc::clone(&monitor);
        let handle = tokio::spawn(async move { running.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
