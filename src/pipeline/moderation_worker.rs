// Moderation worker - the raw-content handler.
//
// Decodes a submission, asks the classifier for a verdict, and publishes the
// result to moderation-results (plus flagged-content when flagged). Any
// failure is returned as a HandlerError so the consumer dead-letters the
// message.

use super::ingest::ContentSubmission;
use crate::core::messaging::{
    BrokerProducer, ConsumedMessage, HandlerError, MessageHandler, OutgoingMessage, Producer,
    TopicConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// CLASSIFIER (PORT)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub flagged: bool,
    pub reasons: Vec<String>,
}

/// Whatever actually judges content. Model inference lives behind this.
#[async_trait]
pub trait ContentClassifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, text: &str) -> anyhow::Result<Verdict>;
}

/// Flags text containing any of a fixed list of terms (case-insensitive).
pub struct BlocklistClassifier {
    terms: Vec<String>,
}

impl BlocklistClassifier {
    pub fn new(terms: Vec<String>) -> Self {
        Self {
            terms: terms.into_iter().map(|t| t.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl ContentClassifier for BlocklistClassifier {
    fn name(&self) -> &str {
        "blocklist"
    }

    async fn classify(&self, text: &str) -> anyhow::Result<Verdict> {
        let text = text.to_lowercase();
        let reasons: Vec<String> = self
            .terms
            .iter()
            .filter(|term| text.contains(term.as_str()))
            .map(|term| format!("blocked term: {}", term))
            .collect();
        Ok(Verdict {
            flagged: !reasons.is_empty(),
            reasons,
        })
    }
}

// ============================================================================
// WORKER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationResult {
    pub content_id: String,
    pub user_id: String,
    pub flagged: bool,
    pub reasons: Vec<String>,
    pub classifier: String,
    pub source_message_id: Option<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct ModerationWorker {
    classifier: Arc<dyn ContentClassifier>,
    producer: Arc<Producer<dyn BrokerProducer>>,
    topics: TopicConfig,
}

impl ModerationWorker {
    pub fn new(
        classifier: Arc<dyn ContentClassifier>,
        producer: Arc<Producer<dyn BrokerProducer>>,
        topics: TopicConfig,
    ) -> Self {
        Self {
            classifier,
            producer,
            topics,
        }
    }

    async fn publish(&self, topic: &str, result: &ModerationResult) -> Result<(), HandlerError> {
        let message = OutgoingMessage::new(serde_json::to_value(result)?)
            .with_key(result.user_id.clone());
        self.producer
            .publish(topic, message)
            .await
            .map_err(|e| HandlerError::new("DeliveryError", e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ModerationWorker {
    async fn handle(&self, message: &ConsumedMessage) -> Result<(), HandlerError> {
        let submission: ContentSubmission = message.json()?;
        if submission.text.trim().is_empty() {
            return Err(HandlerError::new("ValidationError", "submission has no text"));
        }

        let verdict = self
            .classifier
            .classify(&submission.text)
            .await
            .map_err(|e| HandlerError::new("ClassifierError", format!("{:#}", e)))?;

        let result = ModerationResult {
            content_id: submission.content_id,
            user_id: submission.user_id,
            flagged: verdict.flagged,
            reasons: verdict.reasons,
            classifier: self.classifier.name().to_string(),
            source_message_id: message.headers.get("messageId").cloned(),
            checked_at: Utc::now(),
        };

        self.publish(&self.topics.moderation_results, &result).await?;
        if result.flagged {
            tracing::info!(
                content_id = %result.content_id,
                user_id = %result.user_id,
                reasons = ?result.reasons,
                "Content flagged"
            );
            self.publish(&self.topics.flagged_content, &result).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messaging::{Headers, RetryPolicy};
    use crate::infra::broker::InMemoryBroker;

    struct BrokenClassifier;

    #[async_trait]
    impl ContentClassifier for BrokenClassifier {
        fn name(&self) -> &str {
            "broken"
        }

        async fn classify(&self, _text: &str) -> anyhow::Result<Verdict> {
            anyhow::bail!("model not loaded")
        }
    }

    async fn worker(broker: &InMemoryBroker, classifier: Arc<dyn ContentClassifier>) -> ModerationWorker {
        let client = Arc::new(broker.producer());
        client.connect().await.unwrap();
        let client: Arc<dyn BrokerProducer> = client;
        let producer = Arc::new(Producer::new(client, RetryPolicy::default(), "dead-letter"));
        ModerationWorker::new(classifier, producer, TopicConfig::default())
    }

    fn raw(submission: &ContentSubmission) -> ConsumedMessage {
        let mut headers = Headers::new();
        headers.insert("messageId".to_string(), "m-1".to_string());
        ConsumedMessage {
            topic: "raw-content".to_string(),
            partition: 0,
            offset: 0,
            key: Some(submission.user_id.clone()),
            payload: serde_json::to_vec(submission).unwrap(),
            headers,
        }
    }

    fn blocklist() -> Arc<dyn ContentClassifier> {
        Arc::new(BlocklistClassifier::new(vec!["Scam".to_string()]))
    }

    #[tokio::test]
    async fn test_blocklist_classifier() {
        let classifier = BlocklistClassifier::new(vec!["scam".to_string(), "spam".to_string()]);
        let verdict = classifier.classify("Total SCAM here").await.unwrap();
        assert!(verdict.flagged);
        assert_eq!(verdict.reasons, vec!["blocked term: scam"]);

        assert!(!classifier.classify("all good").await.unwrap().flagged);
    }

    #[tokio::test]
    async fn test_clean_content_goes_to_results_only() {
        let broker = InMemoryBroker::new(1);
        let worker = worker(&broker, blocklist()).await;

        worker
            .handle(&raw(&ContentSubmission::new("u1", "hello")))
            .await
            .unwrap();

        let results = broker.records("moderation-results");
        assert_eq!(results.len(), 1);
        let result: ModerationResult = results[0].json().unwrap();
        assert!(!result.flagged);
        assert_eq!(result.source_message_id.as_deref(), Some("m-1"));
        assert!(broker.records("flagged-content").is_empty());
    }

    #[tokio::test]
    async fn test_flagged_content_goes_to_both_topics() {
        let broker = InMemoryBroker::new(1);
        let worker = worker(&broker, blocklist()).await;

        worker
            .handle(&raw(&ContentSubmission::new("u1", "this is a scam")))
            .await
            .unwrap();

        assert_eq!(broker.records("moderation-results").len(), 1);
        let flagged: ModerationResult = broker.records("flagged-content")[0].json().unwrap();
        assert!(flagged.flagged);
        assert_eq!(flagged.user_id, "u1");
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_handler_error() {
        let broker = InMemoryBroker::new(1);
        let worker = worker(&broker, blocklist()).await;

        let mut message = raw(&ContentSubmission::new("u1", "hi"));
        message.payload = b"not json".to_vec();

        let err = worker.handle(&message).await.unwrap_err();
        assert_eq!(err.kind, "DecodeError");
    }

    #[tokio::test]
    async fn test_classifier_failure_is_a_handler_error() {
        let broker = InMemoryBroker::new(1);
        let worker = worker(&broker, Arc::new(BrokenClassifier)).await;

        let err = worker
            .handle(&raw(&ContentSubmission::new("u1", "hi")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "ClassifierError");
        assert_eq!(err.message, "model not loaded");
    }
}
