// Token bucket rate limiter backed by the shared store.
//
// Admission control for inbound content, keyed by an arbitrary identifier
// (usually `user:<id>`). Each check is read -> refill -> decide -> write, and
// the write is a compare-and-swap against the exact record that was read. If
// another process changed the bucket in between, the swap fails and the check
// starts over from a fresh read. Two concurrent checks can therefore never
// both spend the same token.
//
// Failure policy: if the store is unreachable the request is ADMITTED
// (fail open). An outage of the coordination layer must not take ingestion
// down with it. Every such admission is logged as a degraded-mode event.

use super::bucket::{bucket_ttl, Bucket};
use crate::core::store::{rate_limit_key, SharedStore, StoreError};
use chrono::Utc;
use std::sync::Arc;

/// How many times a check re-reads the bucket after losing a swap race.
const MAX_SWAP_ATTEMPTS: u32 = 5;

/// Internal result of one check, before the fail-open policy is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Allowed,
    Denied,
    /// Lost every swap race. Something else is hammering this identifier.
    Contended,
}

pub struct RateLimiter<S: SharedStore + ?Sized> {
    store: Arc<S>,
}

impl<S: SharedStore + ?Sized> RateLimiter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Check whether `identifier` may spend `tokens_requested` tokens now.
    pub async fn check(
        &self,
        identifier: &str,
        max_tokens: u32,
        refill_rate: f64,
        tokens_requested: u32,
    ) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        self.check_at(identifier, max_tokens, refill_rate, tokens_requested, now_ms)
            .await
    }

    /// Same as `check`, with the current time supplied by the caller.
    pub async fn check_at(
        &self,
        identifier: &str,
        max_tokens: u32,
        refill_rate: f64,
        tokens_requested: u32,
        now_ms: i64,
    ) -> bool {
        if max_tokens == 0
            || !refill_rate.is_finite()
            || refill_rate <= 0.0
            || tokens_requested == 0
            || tokens_requested > max_tokens
        {
            tracing::warn!(
                identifier,
                max_tokens,
                refill_rate,
                tokens_requested,
                "Rejecting rate limit check with invalid parameters"
            );
            return false;
        }

        match self
            .evaluate(identifier, max_tokens, refill_rate, tokens_requested, now_ms)
            .await
        {
            Ok(Outcome::Allowed) => true,
            Ok(Outcome::Denied) => {
                tracing::debug!(identifier, tokens_requested, "Rate limit exceeded");
                false
            }
            Ok(Outcome::Contended) => {
                tracing::warn!(
                    identifier,
                    attempts = MAX_SWAP_ATTEMPTS,
                    "Rate limit bucket under heavy contention; denying"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    identifier,
                    error = %e,
                    "Rate limiter store unavailable; failing open and admitting request"
                );
                true
            }
        }
    }

    async fn evaluate(
        &self,
        identifier: &str,
        max_tokens: u32,
        refill_rate: f64,
        tokens_requested: u32,
        now_ms: i64,
    ) -> Result<Outcome, StoreError> {
        let key = rate_limit_key(identifier);
        let ttl = bucket_ttl(max_tokens, refill_rate);

        for attempt in 0..MAX_SWAP_ATTEMPTS {
            let raw = self.store.get(&key).await?;

            let mut bucket = match raw.as_deref() {
                None => Bucket::full(max_tokens, now_ms),
                Some(raw) => match Bucket::decode(raw, max_tokens) {
                    Ok(bucket) => bucket,
                    Err(e) => {
                        // Degraded mode: admit and replace the record with a fresh bucket.
                        tracing::warn!(
                            identifier,
                            error = %e,
                            "Malformed rate limit bucket; failing open and resetting it"
                        );
                        Bucket::full(max_tokens, now_ms)
                    }
                },
            };

            bucket.refill(max_tokens, refill_rate, now_ms);
            if !bucket.try_take(tokens_requested) {
                // Nothing is written on denial.
                return Ok(Outcome::Denied);
            }

            if self
                .store
                .compare_and_swap(&key, raw.as_deref(), &bucket.encode(), ttl)
                .await?
            {
                return Ok(Outcome::Allowed);
            }

            tracing::debug!(identifier, attempt = attempt + 1, "Bucket changed under us; retrying");
        }

        Ok(Outcome::Contended)
    }

    /// Drop the bucket for `identifier` so its next check starts full.
    #[allow(dead_code)]
    pub async fn reset(&self, identifier: &str) -> bool {
        match self.store.delete(&rate_limit_key(identifier)).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(identifier, error = %e, "Failed to reset rate limit bucket");
                false
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
