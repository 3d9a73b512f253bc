// Dead-letter routing for messages whose handler failed.
//
// A failed dead-letter publish is logged and then dropped. The failure
// record is lost in that case; the original processing failure is still in
// the local log. Consumers never block on this path.

use super::handler::ProcessingError;
use super::message_models::{ConsumedMessage, DeliveryReceipt};
use super::producer::ProducerError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn send_to_dead_letter(
        &self,
        original: &ConsumedMessage,
        error: &ProcessingError,
    ) -> Result<DeliveryReceipt, ProducerError>;
}

pub struct DeadLetterRouter {
    publisher: Arc<dyn DeadLetterPublisher>,
}

impl DeadLetterRouter {
    pub fn new(publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        Self { publisher }
    }

    pub async fn route(
        &self,
        original: &ConsumedMessage,
        error: &ProcessingError,
    ) -> Option<DeliveryReceipt> {
        match self.publisher.send_to_dead_letter(original, error).await {
            Ok(receipt) => {
                tracing::warn!(
                    topic = %original.topic,
                    partition = original.partition,
                    offset = original.offset,
                    dead_letter_offset = receipt.offset,
                    error = %error,
                    "Message routed to dead-letter topic"
                );
                Some(receipt)
            }
            Err(e) => {
                tracing::error!(
                    topic = %original.topic,
                    partition = original.partition,
                    offset = original.offset,
                    key = ?original.key,
                    processing_error = %error,
                    error = %e,
                    "Dead-letter publish failed; failure record dropped"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messaging::broker::BrokerError;
    use crate::core::messaging::message_models::Headers;
    use crate::core::messaging::producer::DeliveryError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenPublisher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeadLetterPublisher for BrokenPublisher {
        async fn send_to_dead_letter(
            &self,
            _original: &ConsumedMessage,
            _error: &ProcessingError,
        ) -> Result<DeliveryReceipt, ProducerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError {
                topic: "dead-letter".to_string(),
                attempts: 3,
                source: BrokerError::Send("broker down".to_string()),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_failed_dead_letter_publish_is_swallowed() {
        let publisher = Arc::new(BrokenPublisher {
            calls: AtomicUsize::new(0),
        });
        let router = DeadLetterRouter::new(publisher.clone());

        let original = ConsumedMessage {
            topic: "raw-content".to_string(),
            partition: 0,
            offset: 3,
            key: Some("u1".to_string()),
            payload: b"x".to_vec(),
            headers: Headers::new(),
        };
        let error = ProcessingError {
            kind: "Error".to_string(),
            message: "boom".to_string(),
        };

        assert!(router.route(&original, &error).await.is_none());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }
}
