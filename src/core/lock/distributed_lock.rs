// Distributed lock - cross-process mutual exclusion over the shared store.
//
// A lock is a single key holding the owner's token, written with
// "set if absent" and a TTL. Release is an atomic compare-and-delete so a
// holder whose lock already expired can never delete somebody else's lock.
//
// Failure policy: any store error during acquire or release is reported as
// "not acquired" / "not released" (fail closed).
//
// Known limitation: there is no lease renewal. If the critical section runs
// longer than the TTL, the lock expires and another process may take it while
// the first holder still thinks it owns it. Pick TTLs with that in mind.

use crate::core::store::{lock_key, SharedStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// OWNER TOKENS
// ============================================================================

/// Opaque owner token. Generate a fresh one per acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// LOCK SERVICE
// ============================================================================

pub struct DistributedLock<S: SharedStore + ?Sized> {
    store: Arc<S>,
}

impl<S: SharedStore + ?Sized> DistributedLock<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Try once to take `key` for `ttl_secs` seconds. Never blocks or queues.
    pub async fn acquire(&self, key: &str, ttl_secs: u64, owner_token: &str) -> bool {
        if ttl_secs == 0 || owner_token.is_empty() {
            tracing::warn!(lock = key, ttl_secs, "Refusing lock acquire with empty token or zero TTL");
            return false;
        }

        match self
            .store
            .set_if_absent(&lock_key(key), owner_token, Duration::from_secs(ttl_secs))
            .await
        {
            Ok(true) => {
                tracing::debug!(lock = key, ttl_secs, "Lock acquired");
                true
            }
            Ok(false) => {
                tracing::debug!(lock = key, "Lock held by another owner");
                false
            }
            Err(e) => {
                tracing::warn!(lock = key, error = %e, "Lock acquire failed; treating as not acquired");
                false
            }
        }
    }

    /// Release `key` if and only if it is still held by `owner_token`.
    pub async fn release(&self, key: &str, owner_token: &str) -> bool {
        if owner_token.is_empty() {
            return false;
        }

        match self
            .store
            .compare_and_delete(&lock_key(key), owner_token)
            .await
        {
            Ok(true) => {
                tracing::debug!(lock = key, "Lock released");
                true
            }
            Ok(false) => {
                // Expired, or someone else holds it now.
                tracing::debug!(lock = key, "Lock not released: not the current owner");
                false
            }
            Err(e) => {
                tracing::warn!(lock = key, error = %e, "Lock release failed; treating as not released");
                false
            }
        }
    }

    /// Whether a live lock exists for `key`. A store error reports `true`.
    #[allow(dead_code)]
    pub async fn is_locked(&self, key: &str) -> bool {
        match self.store.exists(&lock_key(key)).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(lock = key, error = %e, "Lock status unknown; assuming held");
                true
            }
        }
    }

    /// Run `task` while holding `key`. Returns `None` without running it if
    /// the lock could not be taken.
    pub async fn with_lock<F, T>(&self, key: &str, ttl_secs: u64, task: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let token = LockToken::generate();
        if !self.acquire(key, ttl_secs, token.as_str()).await {
            return None;
        }

        let output = task.await;

        if !self.release(key, token.as_str()).await {
            tracing::warn!(
                lock = key,
                ttl_secs,
                "Lock was gone at release; the critical section may have outlived its TTL"
            );
        }
        Some(output)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::testing::FlakyStore;
    use crate::infra::store::InMemoryStore;

    fn lock_over_memory() -> (Arc<InMemoryStore>, DistributedLock<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (Arc::clone(&store), DistributedLock::new(store))
    }

    #[tokio::test]
    async fn test_second_owner_is_refused() {
        let (_, lock) = lock_over_memory();
        assert!(lock.acquire("job", 30, "t1").await);
        assert!(!lock.acquire("job", 30, "t2").await);
        // Same owner cannot re-enter either
        assert!(!lock.acquire("job", 30, "t1").await);
    }

    #[tokio::test]
    async fn test_only_owner_can_release() {
        let (store, lock) = lock_over_memory();
        assert!(lock.acquire("job", 30, "t1").await);

        assert!(!lock.release("job", "t2").await);
        assert_eq!(
            store.get("lock:job").await.unwrap().as_deref(),
            Some("t1")
        );

        assert!(lock.release("job", "t1").await);
        assert!(lock.acquire("job", 30, "t2").await);
    }

    #[tokio::test]
    async fn test_release_twice_reports_false() {
        let (_, lock) = lock_over_memory();
        assert!(lock.acquire("job", 30, "t1").await);
        assert!(lock.release("job", "t1").await);
        assert!(!lock.release("job", "t1").await);
    }

    #[tokio::test]
    async fn test_expired_holder_cannot_release_new_owner() {
        let (_, lock) = lock_over_memory();
        assert!(lock.acquire("job", 1, "t1").await);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(lock.acquire("job", 30, "t2").await);
        assert!(!lock.release("job", "t1").await);
        assert!(lock.is_locked("job").await);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (_, lock) = lock_over_memory();
        assert!(!lock.acquire("job", 0, "t1").await);
        assert!(!lock.acquire("job", 30, "").await);
        assert!(!lock.release("job", "").await);
        assert!(!lock.is_locked("job").await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_, lock) = lock_over_memory();
        assert!(lock.acquire("a", 30, "t1").await);
        assert!(lock.acquire("b", 30, "t1").await);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let store = Arc::new(FlakyStore::new());
        let lock = DistributedLock::new(Arc::clone(&store));

        store.go_down();
        for _ in 0..5 {
            assert!(!lock.acquire("job", 30, "t1").await);
        }
        assert!(lock.is_locked("job").await);

        store.recover();
        assert!(lock.acquire("job", 30, "t1").await);

        store.go_down();
        assert!(!lock.release("job", "t1").await);
        store.recover();
        assert!(lock.release("job", "t1").await);
    }

    #[tokio::test]
    async fn test_with_lock_runs_and_releases() {
        let (_, lock) = lock_over_memory();

        let out = lock.with_lock("job", 30, async { 42 }).await;
        assert_eq!(out, Some(42));
        assert!(!lock.is_locked("job").await);
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held() {
        let (_, lock) = lock_over_memory();
        assert!(lock.acquire("job", 30, "other").await);

        let mut ran = false;
        let out = lock.with_lock("job", 30, async { ran = true }).await;
        assert!(out.is_none());
        assert!(!ran);
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = LockToken::generate();
        let b = LockToken::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }
}
