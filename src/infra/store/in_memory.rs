// In-process implementation of SharedStore.
//
// Only shared between tasks of one process, so it gives no cross-process
// coordination. Useful for local runs and for exercising the core in tests.
// Every conditional operation goes through DashMap's entry API, which holds
// the shard lock for the whole read-decide-write.

use crate::core::store::{SharedStore, StoreError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

pub struct InMemoryStore {
    data: DashMap<String, StoredValue>,
    prefix: String,
    connected: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_prefix("")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            data: DashMap::new(),
            prefix: prefix.into(),
            connected: AtomicBool::new(true),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    /// Number of keys physically held, expired ones included.
    #[allow(dead_code)]
    pub fn raw_len(&self) -> usize {
        self.data.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.connected.store(true, Ordering::Release);
        tracing::info!(backend = "memory", "Shared store connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.connected.store(false, Ordering::Release);
        tracing::info!(backend = "memory", "Shared store disconnected");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_connected()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_connected()?;
        let key = self.key(key);
        let now = Instant::now();

        match self.data.get(&key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        // Expired: evict lazily. The read guard is already dropped here.
        self.data.remove_if(&key, |_, v| !v.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.data.insert(self.key(key), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();

        match self.data.entry(self.key(key)) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Ok(false);
                }
                entry.insert(StoredValue::new(value, Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .data
            .remove(&self.key(key))
            .map(|(_, v)| v.is_live(now))
            .unwrap_or(false))
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();

        match self.data.entry(self.key(key)) {
            Entry::Occupied(mut entry) => {
                let current = if entry.get().is_live(now) {
                    entry.get().value.parse::<i64>().map_err(|_| {
                        StoreError::Operation("value is not an integer".to_string())
                    })?
                } else {
                    0
                };
                let next = current.saturating_add(by);
                let expires_at = if entry.get().is_live(now) {
                    entry.get().expires_at
                } else {
                    None
                };
                entry.insert(StoredValue {
                    value: next.to_string(),
                    expires_at,
                });
                Ok(next)
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::new(&by.to_string(), None));
                Ok(by)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .data
            .get(&self.key(key))
            .map(|entry| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .data
            .remove_if(&self.key(key), |_, v| v.is_live(now) && v.value == expected)
            .is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let now = Instant::now();

        match self.data.entry(self.key(key)) {
            Entry::Occupied(mut entry) => {
                let current = if entry.get().is_live(now) {
                    Some(entry.get().value.as_str())
                } else {
                    None
                };
                if current != expected {
                    return Ok(false);
                }
                entry.insert(StoredValue::new(new_value, Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Ok(false);
                }
                entry.insert(StoredValue::new(new_value, Some(ttl)));
                Ok(true)
            }
        }
    }
}
