// Data types for the message pipeline.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type Headers = BTreeMap<String, String>;

pub const HEADER_MESSAGE_ID: &str = "messageId";
pub const HEADER_CONTENT_TYPE: &str = "contentType";
pub const HEADER_TIMESTAMP: &str = "timestamp";
pub const HEADER_ORIGINAL_TOPIC: &str = "originalTopic";
pub const HEADER_FAILURE_REASON: &str = "failureReason";

// ============================================================================
// TOPICS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub raw_content: String,
    pub moderation_results: String,
    pub flagged_content: String,
    pub dead_letter: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            raw_content: "raw-content".to_string(),
            moderation_results: "moderation-results".to_string(),
            flagged_content: "flagged-content".to_string(),
            dead_letter: "dead-letter".to_string(),
        }
    }
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// What a caller hands to `Producer::publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Partition affinity. Messages with the same key keep their order.
    pub key: Option<String>,
    pub value: Value,
    pub headers: Headers,
}

impl OutgoingMessage {
    pub fn new(value: Value) -> Self {
        Self {
            key: None,
            value,
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A fully built record as it goes onto the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl OutboundRecord {
    pub fn message_id(&self) -> &str {
        self.headers
            .get(HEADER_MESSAGE_ID)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Wrap `message` in the pipeline envelope.
    ///
    /// Object payloads get `messageId` and `publishedAt` injected next to their
    /// own fields; anything else is wrapped as `{"data": value, ...}`.
    pub fn envelope(topic: &str, message: OutgoingMessage, now: DateTime<Utc>) -> Self {
        let message_id = Uuid::new_v4().to_string();
        let published_at = now.to_rfc3339();

        let body = match message.value {
            Value::Object(mut fields) => {
                fields.insert("messageId".to_string(), json!(message_id));
                fields.insert("publishedAt".to_string(), json!(published_at));
                Value::Object(fields)
            }
            other => json!({
                "data": other,
                "messageId": message_id,
                "publishedAt": published_at,
            }),
        };

        let mut headers = message.headers;
        headers.insert(HEADER_MESSAGE_ID.to_string(), message_id);
        headers.insert(HEADER_CONTENT_TYPE.to_string(), "application/json".to_string());
        headers.insert(HEADER_TIMESTAMP.to_string(), now.timestamp_millis().to_string());

        Self {
            topic: topic.to_string(),
            key: message.key,
            payload: body.to_string().into_bytes(),
            headers,
        }
    }
}

/// Where the broker put an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub message_id: String,
}

// ============================================================================
// INBOUND
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl ConsumedMessage {
    #[allow(dead_code)]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

// ============================================================================
// DEAD LETTERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterOriginal {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// Payload as text. Non UTF-8 bytes are replaced.
    pub value: String,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterFailure {
    pub message: String,
    pub name: String,
}

/// Body of a dead-letter record. The producer envelope adds `messageId`
/// and `publishedAt` on top of these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_message: DeadLetterOriginal,
    pub error: DeadLetterFailure,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(original: &ConsumedMessage, kind: &str, message: &str, failed_at: DateTime<Utc>) -> Self {
        Self {
            original_message: DeadLetterOriginal {
                topic: original.topic.clone(),
                partition: original.partition,
                offset: original.offset,
                key: original.key.clone(),
                value: String::from_utf8_lossy(&original.payload).into_owned(),
                headers: original.headers.clone(),
            },
            error: DeadLetterFailure {
                message: message.to_string(),
                name: kind.to_string(),
            },
            failed_at,
        }
    }
}
