// Redis implementation of SharedStore.
//
// One `ConnectionManager` per process. It multiplexes every caller over a
// single connection and reconnects on its own after transient failures, so no
// locking is needed around it here.
//
// The conditional operations run as Lua scripts: Redis executes a script as a
// single unit, which is what makes owner-checked lock release and bucket
// compare-and-swap safe against other processes.

use crate::core::store::{SharedStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tokio::sync::RwLock;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// ARGV[1] = '1' when the key must be absent, ARGV[2] = expected value,
// ARGV[3] = new value, ARGV[4] = ttl in milliseconds.
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current then
        return 0
    end
elseif current ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

pub struct RedisStore {
    client: Client,
    prefix: String,
    connect_timeout: Duration,
    connection: RwLock<Option<ConnectionManager>>,
    compare_and_delete: Script,
    compare_and_swap: Script,
}

impl RedisStore {
    pub fn new(
        url: &str,
        prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.into(),
            connect_timeout,
            connection: RwLock::new(None),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(StoreError::NotConnected)
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        // PX 0 is rejected by Redis
        (ttl.as_millis() as u64).max(1)
    }
}

fn op_err(e: redis::RedisError) -> StoreError {
    StoreError::Operation(e.to_string())
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let manager = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_connection_manager(),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.connect_timeout))?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        *self.connection.write().await = Some(manager);
        self.ping().await?;

        tracing::info!(backend = "redis", prefix = %self.prefix, "Shared store connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        // Dropping the last manager clone closes the socket.
        if self.connection.write().await.take().is_some() {
            tracing::info!(backend = "redis", "Shared store disconnected");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(op_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::ttl_ms(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await.map_err(op_err)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        // SET NX replies OK on success and nil when the key already exists
        let reply = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_ms(ttl))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("INCRBY")
            .arg(self.key(key))
            .arg(by)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(op_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let count = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(count > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed = self
            .compare_and_delete
            .key(self.key(key))
            .arg(expected)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(removed == 1)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let (must_be_absent, expected) = match expected {
            Some(value) => ("0", value),
            None => ("1", ""),
        };
        let swapped = self
            .compare_and_swap
            .key(self.key(key))
            .arg(must_be_absent)
            .arg(expected)
            .arg(new_value)
            .arg(Self::ttl_ms(ttl))
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(swapped == 1)
    }
}
