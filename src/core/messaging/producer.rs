// Producer - reliable publishing on top of a BrokerProducer.
//
// - At most one publish in flight per producer. The send mutex is held for
//   the whole retry loop, so records from one producer land in call order.
// - Bounded retries with exponential backoff plus 0-25% jitter.
// - The record (payload and messageId) is built once and reused for every
//   attempt. Together with broker-side idempotence this keeps retries from
//   creating distinct records. A retry after a lost acknowledgement can still
//   duplicate; consumers can dedupe on `messageId`.
// - Exhausted retries surface as a `DeliveryError`. Nothing is dropped silently.

use super::broker::{BrokerError, BrokerProducer};
use super::dead_letter::DeadLetterPublisher;
use super::handler::ProcessingError;
use super::message_models::{
    ConsumedMessage, DeadLetterRecord, DeliveryReceipt, OutboundRecord, OutgoingMessage,
    HEADER_FAILURE_REASON, HEADER_ORIGINAL_TOPIC,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
#[error("Delivery to '{topic}' failed after {attempts} attempt(s): {source}")]
pub struct DeliveryError {
    pub topic: String,
    pub attempts: u32,
    pub source: BrokerError,
}

#[derive(Debug, Error, PartialEq)]
pub enum ProducerError {
    #[error("Producer connection error: {0}")]
    Connection(String),

    #[error("Producer connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Could not serialize record: {0}")]
    Serialization(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max_delay`. No jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus up to 25% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        delay + delay.mul_f64(0.25 * rand::random::<f64>())
    }
}

// ============================================================================
// PRODUCER
// ============================================================================

pub struct Producer<B: BrokerProducer + ?Sized> {
    broker: Arc<B>,
    retry: RetryPolicy,
    dead_letter_topic: String,
    connect_timeout: Duration,
    in_flight: Mutex<()>,
}

impl<B: BrokerProducer + ?Sized> Producer<B> {
    pub fn new(broker: Arc<B>, retry: RetryPolicy, dead_letter_topic: impl Into<String>) -> Self {
        Self {
            broker,
            retry,
            dead_letter_topic: dead_letter_topic.into(),
            connect_timeout: Duration::from_secs(10),
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn connect(&self) -> Result<(), ProducerError> {
        match tokio::time::timeout(self.connect_timeout, self.broker.connect()).await {
            Ok(Ok(())) => {
                tracing::info!("Producer connected");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Producer failed to connect");
                Err(ProducerError::Connection(e.to_string()))
            }
            Err(_) => {
                tracing::error!(timeout = ?self.connect_timeout, "Producer connect timed out");
                Err(ProducerError::Timeout(self.connect_timeout))
            }
        }
    }

    /// Waits for the in-flight publish, if any, before closing.
    pub async fn disconnect(&self) -> Result<(), ProducerError> {
        let _in_flight = self.in_flight.lock().await;
        self.broker
            .disconnect()
            .await
            .map_err(|e| ProducerError::Connection(e.to_string()))?;
        tracing::info!("Producer disconnected");
        Ok(())
    }

    pub async fn publish(
        &self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let record = OutboundRecord::envelope(topic, message, Utc::now());
        self.send_with_retry(&record).await
    }

    async fn send_with_retry(&self, record: &OutboundRecord) -> Result<DeliveryReceipt, DeliveryError> {
        let _in_flight = self.in_flight.lock().await;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match self.broker.send(record).await {
                Ok(receipt) => {
                    tracing::info!(
                        topic = %receipt.topic,
                        key = ?record.key,
                        partition = receipt.partition,
                        offset = receipt.offset,
                        message_id = %receipt.message_id,
                        attempt = attempt + 1,
                        "Message published"
                    );
                    return Ok(receipt);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(
                        topic = %record.topic,
                        key = ?record.key,
                        attempt = attempt + 1,
                        error = %e,
                        "Publish failed with a non-retryable error"
                    );
                    return Err(DeliveryError {
                        topic: record.topic.clone(),
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => {
                    if attempt + 1 < max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        tracing::warn!(
                            topic = %record.topic,
                            key = ?record.key,
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Publish failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let source = last_error.unwrap_or(BrokerError::Send("no attempt was made".to_string()));
        tracing::error!(
            topic = %record.topic,
            key = ?record.key,
            attempts = max_attempts,
            error = %source,
            "Publish failed after all retries"
        );
        Err(DeliveryError {
            topic: record.topic.clone(),
            attempts: max_attempts,
            source,
        })
    }

    /// Publish a dead-letter record for `original` to the dead-letter topic.
    pub async fn send_to_dead_letter(
        &self,
        original: &ConsumedMessage,
        error: &ProcessingError,
    ) -> Result<DeliveryReceipt, ProducerError> {
        let record = DeadLetterRecord::new(original, &error.kind, &error.message, Utc::now());
        let value =
            serde_json::to_value(&record).map_err(|e| ProducerError::Serialization(e.to_string()))?;

        let mut message = OutgoingMessage::new(value)
            .with_header(HEADER_ORIGINAL_TOPIC, original.topic.clone())
            .with_header(HEADER_FAILURE_REASON, error.message.clone());
        message.key = original.key.clone();

        Ok(self.publish(&self.dead_letter_topic, message).await?)
    }
}

#[async_trait]
impl<B: BrokerProducer + ?Sized> DeadLetterPublisher for Producer<B> {
    async fn send_to_dead_letter(
        &self,
        original: &ConsumedMessage,
        error: &ProcessingError,
    ) -> Result<DeliveryReceipt, ProducerError> {
        Producer::<B>::send_to_dead_letter(self, original, error).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
