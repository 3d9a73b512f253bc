// Shared store port - the key/value contract the coordination layer needs.
//
// Both the rate limiter and the distributed lock talk to the store only
// through this trait. The infra layer provides Redis, SQLite and in-memory
// implementations; the core never knows which one it is running against.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// KEY SCHEMA
// ============================================================================
// Adapters prepend their configured prefix to every key, so the effective
// lock key is `<prefix>lock:<lock_key>`.

/// Key holding the token bucket for `identifier`.
pub fn rate_limit_key(identifier: &str) -> String {
    format!("rate_limit:{}", identifier)
}

/// Key holding the owner token for `lock_key`.
pub fn lock_key(lock_key: &str) -> String {
    format!("lock:{}", lock_key)
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached while connecting. Fatal to the owner.
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store connection timed out after {0:?}")]
    Timeout(Duration),

    /// A single store call failed.
    #[error("Store operation error: {0}")]
    Operation(String),

    #[error("Store is not connected")]
    NotConnected,
}

impl StoreError {
    /// Connection-level failures should stop the owning process at startup.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

/// A low-latency key/value store shared by every process in the deployment.
///
/// Implementations must make `set_if_absent`, `compare_and_delete` and
/// `compare_and_swap` atomic with respect to every other client of the store.
/// A get-then-write emulation is not acceptable for those three.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Establish the long-lived connection. Called once by the process entry point.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Close the connection. Further calls fail with `NotConnected`.
    async fn disconnect(&self) -> Result<(), StoreError>;

    /// Round-trip health check.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `ttl = None` keeps the value until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Create `key` only if no live entry exists. Returns whether it was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add `by` to an integer value (absent counts as 0).
    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Replace the value only if it currently equals `expected`
    /// (`None` = only if absent). The new value gets `ttl`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema() {
        assert_eq!(rate_limit_key("user:42"), "rate_limit:user:42");
        assert_eq!(lock_key("consumer-lag-check"), "lock:consumer-lag-check");
    }

    #[test]
    fn test_connection_errors_are_classified() {
        assert!(StoreError::Connection("refused".into()).is_connection_error());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_connection_error());
        assert!(!StoreError::Operation("boom".into()).is_connection_error());
        assert!(!StoreError::NotConnected.is_connection_error());
    }
}
