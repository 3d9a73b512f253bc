// Ingest gate - admission control in front of the raw-content topic.
//
// Each user gets a token bucket (`user:<id>`). Admitted submissions are
// published to raw-content keyed by user, so one user's content stays in
// order on a single partition.

use crate::core::messaging::{BrokerProducer, DeliveryError, DeliveryReceipt, OutgoingMessage, Producer};
use crate::core::rate_limit::RateLimiter;
use crate::core::store::SharedStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSubmission {
    pub content_id: String,
    pub user_id: String,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

impl ContentSubmission {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            content_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            text: text.into(),
            submitted_at: Utc::now(),
        }
    }

    /// Parse a `<user_id> <text>` line. Blank lines and lines with no text
    /// give `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        let (user_id, text) = line.trim().split_once(char::is_whitespace)?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self::new(user_id, text))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(DeliveryReceipt),
    RateLimited,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Could not encode submission: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

pub struct IngestGate {
    limiter: RateLimiter<dyn SharedStore>,
    producer: Arc<Producer<dyn BrokerProducer>>,
    topic: String,
    max_tokens: u32,
    refill_per_sec: f64,
}

impl IngestGate {
    pub fn new(
        store: Arc<dyn SharedStore>,
        producer: Arc<Producer<dyn BrokerProducer>>,
        topic: impl Into<String>,
        max_tokens: u32,
        refill_per_sec: f64,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(store),
            producer,
            topic: topic.into(),
            max_tokens,
            refill_per_sec,
        }
    }

    pub async fn submit(&self, submission: &ContentSubmission) -> Result<IngestOutcome, IngestError> {
        let identifier = format!("user:{}", submission.user_id);
        if !self
            .limiter
            .check(&identifier, self.max_tokens, self.refill_per_sec, 1)
            .await
        {
            tracing::info!(
                user_id = %submission.user_id,
                content_id = %submission.content_id,
                "Submission rate limited"
            );
            return Ok(IngestOutcome::RateLimited);
        }

        let message = OutgoingMessage::new(serde_json::to_value(submission)?)
            .with_key(submission.user_id.clone())
            .with_header("contentId", submission.content_id.clone());
        let receipt = self.producer.publish(&self.topic, message).await?;
        Ok(IngestOutcome::Accepted(receipt))
    }
}
