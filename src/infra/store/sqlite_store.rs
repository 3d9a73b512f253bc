// SQLite-backed shared store for single-host deployments.
//
// Every process on the host opens the same database file, so the conditional
// statements below coordinate across processes: SQLite serializes writers and
// each statement is atomic on its own.
//
// Tables:
// - shared_kv: key -> value with an optional absolute expiry (epoch ms)
//
// Expired rows are treated as absent by every query and removed by
// `purge_expired`, or overwritten in place by the next write.

use crate::core::store::{SharedStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;

const LIVE: &str = "(expires_at_ms IS NULL OR expires_at_ms > ?)";

pub struct SqliteSharedStore {
    path: PathBuf,
    prefix: String,
    connect_timeout: Duration,
    pool: RwLock<Option<Pool<Sqlite>>>,
}

impl SqliteSharedStore {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
            connect_timeout,
            pool: RwLock::new(None),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| Self::now_ms().saturating_add(ttl.as_millis() as i64))
    }

    async fn pool(&self) -> Result<Pool<Sqlite>, StoreError> {
        self.pool.read().await.clone().ok_or(StoreError::NotConnected)
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(pool: &Pool<Sqlite>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shared_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_shared_kv_expiry
                ON shared_kv(expires_at_ms);
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(())
    }

    /// Remove expired rows. Returns how many were deleted.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        let result =
            sqlx::query("DELETE FROM shared_kv WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?")
                .bind(Self::now_ms())
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Upsert that only replaces a row when it has expired.
    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO shared_kv (key, value, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms
            WHERE shared_kv.expires_at_ms IS NOT NULL AND shared_kv.expires_at_ms <= ?
            "#,
        )
        .bind(self.key(key))
        .bind(value)
        .bind(Self::expiry_ms(Some(ttl)))
        .bind(Self::now_ms())
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SharedStore for SqliteSharedStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .busy_timeout(self.connect_timeout);

        let pool = tokio::time::timeout(
            self.connect_timeout,
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(self.connect_timeout)
                .connect_with(options),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.connect_timeout))?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        Self::migrate(&pool).await?;
        *self.pool.write().await = Some(pool);

        tracing::info!(backend = "sqlite", path = %self.path.display(), "Shared store connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            tracing::info!(backend = "sqlite", "Shared store disconnected");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let pool = self.pool().await?;
        let row = sqlx::query(&format!(
            "SELECT value FROM shared_kv WHERE key = ? AND {}",
            LIVE
        ))
        .bind(self.key(key))
        .bind(Self::now_ms())
        .fetch_optional(&pool)
        .await
        .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO shared_kv (key, value, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms
            "#,
        )
        .bind(self.key(key))
        .bind(value)
        .bind(Self::expiry_ms(ttl))
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.insert_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let result = sqlx::query(&format!("DELETE FROM shared_kv WHERE key = ? AND {}", LIVE))
            .bind(self.key(key))
            .bind(Self::now_ms())
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let pool = self.pool().await?;
        let now = Self::now_ms();
        let row = sqlx::query(
            r#"
            INSERT INTO shared_kv (key, value, expires_at_ms)
            VALUES (?, ?, NULL)
            ON CONFLICT(key) DO UPDATE SET
                value = CASE
                    WHEN shared_kv.expires_at_ms IS NULL OR shared_kv.expires_at_ms > ?
                    THEN CASE
                        WHEN CAST(CAST(shared_kv.value AS INTEGER) AS TEXT) = shared_kv.value
                        THEN CAST(CAST(shared_kv.value AS INTEGER) + ? AS TEXT)
                        ELSE shared_kv.value
                    END
                    ELSE excluded.value
                END,
                expires_at_ms = CASE
                    WHEN shared_kv.expires_at_ms IS NULL OR shared_kv.expires_at_ms > ?
                    THEN shared_kv.expires_at_ms
                    ELSE NULL
                END
            RETURNING value
            "#,
        )
        .bind(self.key(key))
        .bind(by.to_string())
        .bind(now)
        .bind(by)
        .bind(now)
        .fetch_one(&pool)
        .await
        .map_err(|e| StoreError::Operation(e.to_string()))?;

        // A non-integer value is left as it was and comes back unparsable.
        let value: String = row.get("value");
        value
            .parse::<i64>()
            .map_err(|_| StoreError::Operation("value is not an integer".to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let pool = self.pool().await?;
        let result = sqlx::query(&format!(
            "DELETE FROM shared_kv WHERE key = ? AND value = ? AND {}",
            LIVE
        ))
        .bind(self.key(key))
        .bind(expected)
        .bind(Self::now_ms())
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let Some(expected) = expected else {
            return self.insert_if_absent(key, new_value, ttl).await;
        };

        let pool = self.pool().await?;
        let result = sqlx::query(&format!(
            "UPDATE shared_kv SET value = ?, expires_at_ms = ? WHERE key = ? AND value = ? AND {}",
            LIVE
        ))
        .bind(new_value)
        .bind(Self::expiry_ms(Some(ttl)))
        .bind(self.key(key))
        .bind(expected)
        .bind(Self::now_ms())
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
