// In-process message broker.
//
// Topics are split into a fixed number of append-only partition logs. Keyed
// records always land on the same partition; unkeyed ones are spread
// round-robin. Each consumer group has one offset per partition, advanced as
// soon as a record is handed out. Consumers of the same group share the work,
// consumers of different groups each see every record.
//
// Nothing leaves the process, so this is for local runs and tests. It stands
// in for a real broker without changing anything above the port.

use crate::core::messaging::{
    BrokerConsumer, BrokerError, BrokerProducer, ConsumedMessage, ConsumerEvent, DeliveryReceipt,
    OutboundRecord, PartitionLag,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct GroupPartition {
    group: String,
    topic: String,
    partition: i32,
}

struct TopicLog {
    partitions: Vec<Vec<ConsumedMessage>>,
    next_partition: usize,
}

impl TopicLog {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions],
            next_partition: 0,
        }
    }
}

struct BrokerState {
    partitions: usize,
    topics: DashMap<String, TopicLog>,
    group_offsets: DashMap<GroupPartition, i64>,
    appended: Notify,
}

impl BrokerState {
    fn partition_for_key(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as usize
    }

    fn append(&self, record: &OutboundRecord) -> DeliveryReceipt {
        let mut topic = self
            .topics
            .entry(record.topic.clone())
            .or_insert_with(|| TopicLog::new(self.partitions));

        let partition = match &record.key {
            Some(key) => self.partition_for_key(key),
            None => {
                let p = topic.next_partition;
                topic.next_partition = (p + 1) % self.partitions;
                p
            }
        };

        let log = &mut topic.partitions[partition];
        let offset = log.len() as i64;
        log.push(ConsumedMessage {
            topic: record.topic.clone(),
            partition: partition as i32,
            offset,
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
        });
        drop(topic);

        self.appended.notify_waiters();

        DeliveryReceipt {
            topic: record.topic.clone(),
            partition: partition as i32,
            offset,
            message_id: record.message_id().to_string(),
        }
    }

    /// Hand out the record at the group's offset for one partition, if any.
    fn take(&self, group: &str, topic: &str, partition: i32) -> Option<ConsumedMessage> {
        // The offset entry stays locked until the record is taken, so two
        // consumers of one group never get the same record.
        let mut offset = self
            .group_offsets
            .entry(GroupPartition {
                group: group.to_string(),
                topic: topic.to_string(),
                partition,
            })
            .or_insert(0);

        let log = self.topics.get(topic)?;
        let message = log
            .partitions
            .get(partition as usize)?
            .get(*offset as usize)?
            .clone();
        *offset += 1;
        Some(message)
    }

    fn lag(&self, group: &str, topic: &str) -> Vec<PartitionLag> {
        let ends: Vec<i64> = match self.topics.get(topic) {
            Some(log) => log.partitions.iter().map(|p| p.len() as i64).collect(),
            None => vec![0; self.partitions],
        };

        ends.into_iter()
            .enumerate()
            .map(|(partition, end)| {
                let committed = self
                    .group_offsets
                    .get(&GroupPartition {
                        group: group.to_string(),
                        topic: topic.to_string(),
                        partition: partition as i32,
                    })
                    .map(|o| *o)
                    .unwrap_or(0);
                PartitionLag {
                    topic: topic.to_string(),
                    partition: partition as i32,
                    committed,
                    end,
                }
            })
            .collect()
    }
}

// ============================================================================
// BROKER
// ============================================================================

#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                partitions: partitions.max(1),
                topics: DashMap::new(),
                group_offsets: DashMap::new(),
                appended: Notify::new(),
            }),
        }
    }

    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(false),
        }
    }

    pub fn consumer(&self, group_id: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            state: Arc::clone(&self.state),
            group: group_id.into(),
            connected: AtomicBool::new(false),
            subscription: RwLock::new(Vec::new()),
            rebalance: AtomicU8::new(REBALANCE_IDLE),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Every record of `topic`, partition by partition, in offset order.
    pub fn records(&self, topic: &str) -> Vec<ConsumedMessage> {
        self.state
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    #[allow(dead_code)]
    pub fn group_lag(&self, group: &str, topic: &str) -> Vec<PartitionLag> {
        self.state.lag(group, topic)
    }
}

// ============================================================================
// PRODUCER HANDLE
// ============================================================================

pub struct InMemoryProducer {
    state: Arc<BrokerState>,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerProducer for InMemoryProducer {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(backend = "memory", "Broker producer connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(backend = "memory", "Broker producer disconnected");
        Ok(())
    }

    async fn send(&self, record: &OutboundRecord) -> Result<DeliveryReceipt, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        Ok(self.state.append(record))
    }
}

// ============================================================================
// CONSUMER HANDLE
// ============================================================================

const REBALANCE_IDLE: u8 = 0;
const REBALANCE_STARTING: u8 = 1;
const REBALANCE_COMPLETING: u8 = 2;

pub struct InMemoryConsumer {
    state: Arc<BrokerState>,
    group: String,
    connected: AtomicBool,
    subscription: RwLock<Vec<String>>,
    rebalance: AtomicU8,
    cursor: AtomicUsize,
}

impl InMemoryConsumer {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    /// A subscription change shows up as Started then Completed on the next two polls.
    fn next_rebalance_event(&self) -> Option<ConsumerEvent> {
        if self
            .rebalance
            .compare_exchange(REBALANCE_STARTING, REBALANCE_COMPLETING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(ConsumerEvent::RebalanceStarted);
        }
        if self
            .rebalance
            .compare_exchange(REBALANCE_COMPLETING, REBALANCE_IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(ConsumerEvent::RebalanceCompleted);
        }
        None
    }

    /// Next record across all subscribed partitions. The starting partition
    /// rotates between calls so one busy partition cannot starve the rest.
    fn take_next(&self, topics: &[String]) -> Option<ConsumedMessage> {
        let slots: Vec<(&str, i32)> = topics
            .iter()
            .flat_map(|t| (0..self.state.partitions as i32).map(move |p| (t.as_str(), p)))
            .collect();
        if slots.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
        (0..slots.len()).find_map(|i| {
            let (topic, partition) = slots[(start + i) % slots.len()];
            self.state.take(&self.group, topic, partition)
        })
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(backend = "memory", group = %self.group, "Broker consumer connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        // Wake any poll in progress so it sees the disconnect.
        self.state.appended.notify_waiters();
        tracing::info!(backend = "memory", group = %self.group, "Broker consumer disconnected");
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        *self.subscription.write().await = topics.to_vec();
        self.rebalance.store(REBALANCE_STARTING, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_connected()?;
            if let Some(event) = self.next_rebalance_event() {
                return Ok(Some(event));
            }

            // Register for wakeups before looking, so an append in between is not missed.
            let appended = self.state.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let topics = self.subscription.read().await.clone();
            if let Some(message) = self.take_next(&topics) {
                return Ok(Some(ConsumerEvent::Message(message)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn lag(&self) -> Result<Vec<PartitionLag>, BrokerError> {
        self.ensure_connected()?;
        let topics = self.subscription.read().await.clone();
        Ok(topics
            .iter()
            .flat_map(|topic| self.state.lag(&self.group, topic))
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messaging::{Headers, OutgoingMessage};
    use chrono::Utc;
    use serde_json::json;

    fn record(topic: &str, key: Option<&str>) -> OutboundRecord {
        let mut message = OutgoingMessage::new(json!({}));
        message.key = key.map(str::to_string);
        OutboundRecord::envelope(topic, message, Utc::now())
    }

    async fn connected(broker: &InMemoryBroker, group: &str, topics: &[&str]) -> InMemoryConsumer {
        let consumer = broker.consumer(group);
        consumer.connect().await.unwrap();
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        consumer.subscribe(&topics).await.unwrap();
        // Drain the rebalance pair
        assert_eq!(
            consumer.poll(Duration::ZERO).await.unwrap(),
            Some(ConsumerEvent::RebalanceStarted)
        );
        assert_eq!(
            consumer.poll(Duration::ZERO).await.unwrap(),
            Some(ConsumerEvent::RebalanceCompleted)
        );
        consumer
    }

    async fn next_message(consumer: &InMemoryConsumer) -> Option<ConsumedMessage> {
        match consumer.poll(Duration::from_millis(10)).await.unwrap() {
            Some(ConsumerEvent::Message(m)) => Some(m),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let broker = InMemoryBroker::new(2);
        let producer = broker.producer();
        assert_eq!(
            producer.send(&record("t", None)).await,
            Err(BrokerError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_same_key_same_partition_in_order() {
        let broker = InMemoryBroker::new(4);
        let producer = broker.producer();
        producer.connect().await.unwrap();

        let mut partitions = Vec::new();
        for expected_offset in 0..5 {
            let receipt = producer.send(&record("t", Some("user-7"))).await.unwrap();
            assert_eq!(receipt.offset, expected_offset);
            partitions.push(receipt.partition);
        }
        assert!(partitions.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_unkeyed_records_round_robin() {
        let broker = InMemoryBroker::new(3);
        let producer = broker.producer();
        producer.connect().await.unwrap();

        let mut partitions = Vec::new();
        for _ in 0..6 {
            partitions.push(producer.send(&record("t", None)).await.unwrap().partition);
        }
        assert_eq!(partitions, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer();
        producer.connect().await.unwrap();
        producer.send(&record("t", None)).await.unwrap();

        let a = connected(&broker, "a", &["t"]).await;
        let b = connected(&broker, "b", &["t"]).await;

        assert!(next_message(&a).await.is_some());
        assert!(next_message(&a).await.is_none());
        assert!(next_message(&b).await.is_some());
    }

    #[tokio::test]
    async fn test_same_group_shares_records() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer();
        producer.connect().await.unwrap();
        producer.send(&record("t", None)).await.unwrap();

        let first = connected(&broker, "g", &["t"]).await;
        let second = connected(&broker, "g", &["t"]).await;

        assert!(next_message(&first).await.is_some());
        assert!(next_message(&second).await.is_none());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = InMemoryBroker::new(1);
        let consumer = connected(&broker, "g", &["t"]).await;
        let producer = broker.producer();
        producer.connect().await.unwrap();

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send(&record("t", Some("k"))).await.unwrap();
        });

        let event = consumer.poll(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(event, Some(ConsumerEvent::Message(_))));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_after_disconnect_is_fatal() {
        let broker = InMemoryBroker::new(1);
        let consumer = connected(&broker, "g", &["t"]).await;
        consumer.disconnect().await.unwrap();

        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_lag_tracks_group_offsets() {
        let broker = InMemoryBroker::new(2);
        let producer = broker.producer();
        producer.connect().await.unwrap();
        for _ in 0..4 {
            producer.send(&record("t", None)).await.unwrap();
        }

        let consumer = connected(&broker, "g", &["t"]).await;
        let total: i64 = consumer.lag().await.unwrap().iter().map(|p| p.lag()).sum();
        assert_eq!(total, 4);

        next_message(&consumer).await.unwrap();
        let total: i64 = consumer.lag().await.unwrap().iter().map(|p| p.lag()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_records_keep_headers() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer();
        producer.connect().await.unwrap();

        let mut headers = Headers::new();
        headers.insert("source".to_string(), "test".to_string());
        let mut rec = record("t", None);
        rec.headers.extend(headers);
        producer.send(&rec).await.unwrap();

        let stored = broker.records("t");
        assert_eq!(stored[0].headers["source"], "test");
        assert_eq!(stored[0].headers["messageId"], rec.message_id());
    }
}
