// Broker ports - what the producer and consumer need from a message broker.

use super::message_models::{ConsumedMessage, DeliveryReceipt, OutboundRecord};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker client is not connected")]
    NotConnected,

    #[error("Broker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Send failed: {0}")]
    Send(String),

    /// The broker refused the record itself (too large, malformed, not
    /// authorized). Sending it again gives the same answer.
    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),
}

impl BrokerError {
    /// Worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Timeout(_) | BrokerError::Send(_)
        )
    }

    /// The client cannot continue without being reconnected from outside.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::NotConnected | BrokerError::ConnectionLost(_))
    }
}

// ============================================================================
// CONSUMER EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Message(ConsumedMessage),
    /// Partition assignment is being revoked and redistributed.
    RebalanceStarted,
    /// New assignment is in place.
    RebalanceCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLag {
    pub topic: String,
    pub partition: i32,
    /// Next offset the group will read.
    pub committed: i64,
    /// Offset the next produced record will get.
    pub end: i64,
}

impl PartitionLag {
    pub fn lag(&self) -> i64 {
        (self.end - self.committed).max(0)
    }
}

// ============================================================================
// PORTS
// ============================================================================

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// One delivery attempt. Retrying is the caller's business.
    async fn send(&self, record: &OutboundRecord) -> Result<DeliveryReceipt, BrokerError>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Replace the subscription with `topics`.
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next event. The offset of a returned
    /// message counts as consumed for the group.
    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError>;

    /// Per-partition lag of this consumer's group over its subscription.
    async fn lag(&self) -> Result<Vec<PartitionLag>, BrokerError>;
}
