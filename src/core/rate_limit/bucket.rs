// Token bucket record and the pure refill arithmetic.
//
// Stored as JSON: {"v":1,"tokens":9.0,"lastRefill":1718000000000}
// `v` is the schema version. Records written before versioning carry no `v`
// and decode as version 1. Any other version is refused rather than guessed at.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const BUCKET_SCHEMA_VERSION: u32 = 1;

fn legacy_version() -> u32 {
    1
}

#[derive(Debug, Error, PartialEq)]
pub enum BucketError {
    #[error("Bucket is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Unsupported bucket schema version {0}")]
    UnsupportedVersion(u32),

    #[error("Bucket holds an invalid token count: {0}")]
    InvalidTokens(f64),

    #[error("Bucket holds an invalid refill timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(rename = "v", default = "legacy_version")]
    pub version: u32,
    pub tokens: f64,
    /// Epoch milliseconds of the last refill that added tokens.
    #[serde(rename = "lastRefill")]
    pub last_refill_ms: i64,
}

impl Bucket {
    /// A bucket seen for the first time starts full.
    pub fn full(max_tokens: u32, now_ms: i64) -> Self {
        Self {
            version: BUCKET_SCHEMA_VERSION,
            tokens: max_tokens as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Parse a stored record.
    ///
    /// A count above `max_tokens` is clamped (the limit may have been lowered
    /// since it was written). Negative or non-finite counts are rejected, as
    /// are negative timestamps.
    pub fn decode(raw: &str, max_tokens: u32) -> Result<Self, BucketError> {
        let mut bucket: Bucket =
            serde_json::from_str(raw).map_err(|e| BucketError::InvalidJson(e.to_string()))?;

        if bucket.version != BUCKET_SCHEMA_VERSION {
            return Err(BucketError::UnsupportedVersion(bucket.version));
        }
        if !bucket.tokens.is_finite() || bucket.tokens < 0.0 {
            return Err(BucketError::InvalidTokens(bucket.tokens));
        }
        if bucket.last_refill_ms < 0 {
            return Err(BucketError::InvalidTimestamp(bucket.last_refill_ms));
        }

        bucket.tokens = bucket.tokens.min(max_tokens as f64);
        Ok(bucket)
    }

    pub fn encode(&self) -> String {
        // Only finite numbers and integers here, so serialization cannot fail.
        serde_json::json!({
            "v": self.version,
            "tokens": self.tokens,
            "lastRefill": self.last_refill_ms,
        })
        .to_string()
    }

    /// Add the whole tokens earned since `last_refill_ms`, capped at `max_tokens`.
    ///
    /// `last_refill_ms` only moves forward by the time those whole tokens account
    /// for, so partial progress toward the next token is kept between checks.
    pub fn refill(&mut self, max_tokens: u32, refill_rate: f64, now_ms: i64) {
        let max = max_tokens as f64;

        if now_ms < self.last_refill_ms {
            // Clock went backwards; restart the accounting from now.
            self.last_refill_ms = now_ms;
            return;
        }

        let elapsed_secs = now_ms.saturating_sub(self.last_refill_ms) as f64 / 1000.0;
        let earned = (elapsed_secs * refill_rate).floor();

        if self.tokens + earned >= max {
            self.tokens = max;
            self.last_refill_ms = now_ms;
        } else if earned >= 1.0 {
            self.tokens += earned;
            let advance_ms = ((earned / refill_rate) * 1000.0) as i64;
            self.last_refill_ms = self.last_refill_ms.saturating_add(advance_ms).min(now_ms);
        }
    }

    /// Take `requested` tokens if available. Leaves the bucket untouched otherwise.
    pub fn try_take(&mut self, requested: u32) -> bool {
        let requested = requested as f64;
        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }
}

/// Expiry for a persisted bucket: twice the time to refill from empty.
/// Idle buckets evict themselves once they would be full anyway.
pub fn bucket_ttl(max_tokens: u32, refill_rate: f64) -> Duration {
    let secs_to_full = (max_tokens as f64 / refill_rate).ceil();
    let ttl_secs = (secs_to_full * 2.0).clamp(1.0, u32::MAX as f64);
    Duration::from_secs(ttl_secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_carries_version() {
        let bucket = Bucket::full(10, 1_000);
        let value: serde_json::Value = serde_json::from_str(&bucket.encode()).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["tokens"], 10.0);
        assert_eq!(value["lastRefill"], 1_000);
    }

    #[test]
    fn test_decode_legacy_record_without_version() {
        let bucket = Bucket::decode(r#"{"tokens":3,"lastRefill":500}"#, 10).unwrap();
        assert_eq!(bucket.version, 1);
        assert_eq!(bucket.tokens, 3.0);
        assert_eq!(bucket.last_refill_ms, 500);
    }

    #[test]
    fn test_decode_rejects_bad_records() {
        assert!(matches!(
            Bucket::decode("not json", 10),
            Err(BucketError::InvalidJson(_))
        ));
        assert_eq!(
            Bucket::decode(r#"{"v":2,"tokens":1,"lastRefill":0}"#, 10),
            Err(BucketError::UnsupportedVersion(2))
        );
        assert_eq!(
            Bucket::decode(r#"{"v":1,"tokens":-1,"lastRefill":0}"#, 10),
            Err(BucketError::InvalidTokens(-1.0))
        );
        assert_eq!(
            Bucket::decode(r#"{"v":1,"tokens":1,"lastRefill":-9223372036854775808}"#, 10),
            Err(BucketError::InvalidTimestamp(i64::MIN))
        );
    }

    #[test]
    fn test_refill_saturates_on_extreme_timestamps() {
        let mut bucket = Bucket {
            version: 1,
            tokens: 0.0,
            last_refill_ms: i64::MIN,
        };
        bucket.refill(10, 1.0, i64::MAX);
        assert_eq!(bucket.tokens, 10.0);
        assert_eq!(bucket.last_refill_ms, i64::MAX);
    }

    #[test]
    fn test_decode_clamps_to_lowered_limit() {
        let bucket = Bucket::decode(r#"{"v":1,"tokens":50,"lastRefill":0}"#, 10).unwrap();
        assert_eq!(bucket.tokens, 10.0);
    }

    #[test]
    fn test_refill_adds_whole_tokens_only() {
        let mut bucket = Bucket {
            version: 1,
            tokens: 0.0,
            last_refill_ms: 0,
        };

        // 0.5 tokens earned: nothing added, progress kept
        bucket.refill(10, 1.0, 500);
        assert_eq!(bucket.tokens, 0.0);
        assert_eq!(bucket.last_refill_ms, 0);

        // 1.5 seconds in total: one token, half a second carried over
        bucket.refill(10, 1.0, 1_500);
        assert_eq!(bucket.tokens, 1.0);
        assert_eq!(bucket.last_refill_ms, 1_000);
    }

    #[test]
    fn test_refill_caps_at_max() {
        let mut bucket = Bucket {
            version: 1,
            tokens: 8.0,
            last_refill_ms: 0,
        };
        bucket.refill(10, 5.0, 60_000);
        assert_eq!(bucket.tokens, 10.0);
        assert_eq!(bucket.last_refill_ms, 60_000);
    }

    #[test]
    fn test_refill_handles_clock_going_backwards() {
        let mut bucket = Bucket::full(10, 5_000);
        bucket.try_take(10);
        bucket.refill(10, 1.0, 1_000);
        assert_eq!(bucket.tokens, 0.0);
        assert_eq!(bucket.last_refill_ms, 1_000);
    }

    #[test]
    fn test_try_take() {
        let mut bucket = Bucket::full(3, 0);
        assert!(bucket.try_take(2));
        assert!(!bucket.try_take(2));
        assert_eq!(bucket.tokens, 1.0);
    }

    #[test]
    fn test_bucket_ttl() {
        assert_eq!(bucket_ttl(10, 1.0), Duration::from_secs(20));
        assert_eq!(bucket_ttl(10, 3.0), Duration::from_secs(8));
        assert_eq!(bucket_ttl(1, 100.0), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            max_tokens in 1u32..100,
            refill_rate in 0.01f64..50.0,
            steps in prop::collection::vec((0i64..10_000, 1u32..10), 1..60),
        ) {
            let mut now = 1_000_000i64;
            let mut bucket = Bucket::full(max_tokens, now);

            for (advance_ms, requested) in steps {
                now += advance_ms;
                bucket.refill(max_tokens, refill_rate, now);
                bucket.try_take(requested);

                let persisted = Bucket::decode(&bucket.encode(), max_tokens).unwrap();
                prop_assert!(persisted.tokens >= 0.0);
                prop_assert!(persisted.tokens <= max_tokens as f64);
                bucket = persisted;
            }
        }
    }
}
