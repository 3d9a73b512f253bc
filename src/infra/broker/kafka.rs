// Kafka implementations of the broker ports (built with `--features kafka`).
//
// The producer is configured for idempotent, strictly ordered delivery:
// `enable.idempotence=true`, `acks=all`, one in-flight request per
// connection. Application-level retries live in core's Producer; librdkafka
// retries underneath it are deduplicated by the broker.
//
// The consumer uses auto offset store and commit, so an offset counts as
// consumed as soon as the record is handed out. Rebalance callbacks from
// librdkafka are forwarded as ConsumerEvents.

use crate::core::messaging::{
    BrokerConsumer, BrokerError, BrokerProducer, ConsumedMessage, ConsumerEvent, DeliveryReceipt,
    Headers, OutboundRecord, PartitionLag,
};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub client_id: String,
    pub group_id: String,
    /// Upper bound for metadata round trips and a single send.
    pub request_timeout: Duration,
}

fn send_error(err: KafkaError, timeout: Duration) -> BrokerError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
            BrokerError::Timeout(timeout)
        }
        KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown) => {
            BrokerError::Connection(err.to_string())
        }
        KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::RecordListTooLarge
            | RDKafkaErrorCode::InvalidTopic
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => BrokerError::Rejected(err.to_string()),
        other => BrokerError::Send(other.to_string()),
    }
}

// ============================================================================
// PRODUCER
// ============================================================================

pub struct KafkaProducerClient {
    settings: KafkaSettings,
    producer: RwLock<Option<FutureProducer>>,
}

impl KafkaProducerClient {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            producer: RwLock::new(None),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.brokers)
            .set("client.id", &self.settings.client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "1")
            .set(
                "message.timeout.ms",
                self.settings.request_timeout.as_millis().to_string(),
            );
        config
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducerClient {
    async fn connect(&self) -> Result<(), BrokerError> {
        let producer: FutureProducer = self
            .client_config()
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        // Creating the client does not touch the network; a metadata fetch does.
        let probe = producer.clone();
        let timeout = self.settings.request_timeout;
        tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        *self.producer.write().await = Some(producer);
        tracing::info!(backend = "kafka", brokers = %self.settings.brokers, "Broker producer connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if let Some(producer) = self.producer.write().await.take() {
            let timeout = self.settings.request_timeout;
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| BrokerError::Send(e.to_string()))?
                .map_err(|e| BrokerError::Send(e.to_string()))?;
        }
        tracing::info!(backend = "kafka", "Broker producer disconnected");
        Ok(())
    }

    async fn send(&self, record: &OutboundRecord) -> Result<DeliveryReceipt, BrokerError> {
        let producer = self
            .producer
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)?;

        let mut headers = OwnedHeaders::new();
        for (name, value) in &record.headers {
            headers = headers.insert(Header {
                key: name,
                value: Some(value.as_bytes()),
            });
        }

        let mut kafka_record = FutureRecord::<str, [u8]>::to(&record.topic)
            .payload(record.payload.as_slice())
            .headers(headers);
        if let Some(key) = &record.key {
            kafka_record = kafka_record.key(key.as_str());
        }

        let timeout = self.settings.request_timeout;
        let (partition, offset) = producer
            .send(kafka_record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| send_error(e, timeout))?;

        Ok(DeliveryReceipt {
            topic: record.topic.clone(),
            partition,
            offset,
            message_id: record.message_id().to_string(),
        })
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

struct RebalanceForwarder {
    events: mpsc::UnboundedSender<ConsumerEvent>,
}

impl ClientContext for RebalanceForwarder {}

impl ConsumerContext for RebalanceForwarder {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        tracing::info!(rebalance = ?rebalance, "Kafka rebalance starting");
        let _ = self.events.send(ConsumerEvent::RebalanceStarted);
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        tracing::info!(rebalance = ?rebalance, "Kafka rebalance finished");
        let _ = self.events.send(ConsumerEvent::RebalanceCompleted);
    }
}

type KafkaStream = StreamConsumer<RebalanceForwarder>;

struct Connection {
    consumer: Arc<KafkaStream>,
    rebalances: mpsc::UnboundedReceiver<ConsumerEvent>,
}

pub struct KafkaConsumerClient {
    settings: KafkaSettings,
    connection: Mutex<Option<Connection>>,
}

impl KafkaConsumerClient {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            connection: Mutex::new(None),
        }
    }

    fn to_consumed(message: &BorrowedMessage<'_>) -> ConsumedMessage {
        let mut headers = Headers::new();
        if let Some(raw) = message.headers() {
            for header in raw.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }

        ConsumedMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        }
    }

    async fn consumer(&self) -> Result<Arc<KafkaStream>, BrokerError> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| Arc::clone(&c.consumer))
            .ok_or(BrokerError::NotConnected)
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumerClient {
    async fn connect(&self) -> Result<(), BrokerError> {
        let (events, rebalances) = mpsc::unbounded_channel();
        let consumer: KafkaStream = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("client.id", &self.settings.client_id)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "true")
            .set("auto.offset.reset", "earliest")
            .create_with_context(RebalanceForwarder { events })
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let consumer = Arc::new(consumer);

        let probe = Arc::clone(&consumer);
        let timeout = self.settings.request_timeout;
        tokio::task::spawn_blocking(move || probe.fetch_metadata(None, Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        *self.connection.lock().await = Some(Connection {
            consumer,
            rebalances,
        });
        tracing::info!(
            backend = "kafka",
            group = %self.settings.group_id,
            "Broker consumer connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.consumer.unsubscribe();
        }
        tracing::info!(backend = "kafka", "Broker consumer disconnected");
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let consumer = self.consumer().await?;
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Receive(e.to_string()))
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError> {
        let consumer = {
            let mut guard = self.connection.lock().await;
            let connection = guard.as_mut().ok_or(BrokerError::NotConnected)?;
            if let Ok(event) = connection.rebalances.try_recv() {
                return Ok(Some(event));
            }
            Arc::clone(&connection.consumer)
        };

        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(ConsumerEvent::Message(Self::to_consumed(&message)))),
            Ok(Err(KafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown))) => Err(
                BrokerError::ConnectionLost("all brokers are down".to_string()),
            ),
            Ok(Err(e)) => Err(BrokerError::Receive(e.to_string())),
        }
    }

    async fn lag(&self) -> Result<Vec<PartitionLag>, BrokerError> {
        let consumer = self.consumer().await?;
        let timeout = self.settings.request_timeout;

        tokio::task::spawn_blocking(move || {
            let positions = consumer
                .position()
                .map_err(|e| BrokerError::Receive(e.to_string()))?;

            let mut lags = Vec::new();
            for element in positions.elements() {
                let (low, high) = consumer
                    .fetch_watermarks(element.topic(), element.partition(), Timeout::After(timeout))
                    .map_err(|e| BrokerError::Receive(e.to_string()))?;
                let committed = match element.offset() {
                    Offset::Offset(n) => n,
                    _ => low,
                };
                lags.push(PartitionLag {
                    topic: element.topic().to_string(),
                    partition: element.partition(),
                    committed,
                    end: high,
                });
            }
            Ok(lags)
        })
        .await
        .map_err(|e| BrokerError::Receive(e.to_string()))?
    }
}
