// Implementations of the broker ports.

pub mod in_memory;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use in_memory::{InMemoryBroker, InMemoryConsumer, InMemoryProducer};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumerClient, KafkaProducerClient, KafkaSettings};
