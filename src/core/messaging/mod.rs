// Core messaging module - reliable publish, per-topic consume, dead letters.

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod handler;
pub mod message_models;
pub mod producer;

#[cfg(test)]
pub mod testing;

pub use broker::{BrokerConsumer, BrokerError, BrokerProducer, ConsumerEvent, PartitionLag};
pub use consumer::{Consumer, ConsumerError, ConsumerState};
pub use dead_letter::{DeadLetterPublisher, DeadLetterRouter};
pub use handler::{handler_fn, HandlerError, MessageHandler, ProcessingError};
pub use message_models::{
    ConsumedMessage, DeadLetterRecord, DeliveryReceipt, Headers, OutboundRecord, OutgoingMessage,
    TopicConfig,
};
pub use producer::{DeliveryError, Producer, ProducerError, RetryPolicy};
