// Process configuration, read from the environment (and `.env` via dotenv).
//
// Every setting has a default so a bare `cargo run` works against a local
// Redis and the in-memory broker. A value that is present but unparsable is
// an error; it is never silently replaced with the default.

use crate::core::messaging::{RetryPolicy, TopicConfig};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Kafka,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub sqlite_path: String,
    pub key_prefix: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub brokers: String,
    pub client_id: String,
    pub group_id: String,
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
    /// Partition count for the in-memory broker.
    pub partitions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub max_tokens: u32,
    pub refill_per_sec: f64,
    pub stdin_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LagMonitorConfig {
    pub interval: Duration,
    pub lock_ttl_secs: u64,
    pub warn_threshold: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub retry: RetryPolicy,
    pub ingest: IngestConfig,
    pub lag_monitor: LagMonitorConfig,
    pub blocked_terms: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let topic_defaults = TopicConfig::default();

        let store_backend = match env.string("STORE_BACKEND", "redis").to_lowercase().as_str() {
            "redis" => StoreBackend::Redis,
            "sqlite" => StoreBackend::Sqlite,
            "memory" => StoreBackend::Memory,
            other => return Err(env.invalid("STORE_BACKEND", other)),
        };
        let broker_backend = match env.string("BROKER_BACKEND", "memory").to_lowercase().as_str() {
            "kafka" => BrokerBackend::Kafka,
            "memory" => BrokerBackend::Memory,
            other => return Err(env.invalid("BROKER_BACKEND", other)),
        };

        let retry = RetryPolicy {
            max_attempts: env.parse("PRODUCER_MAX_ATTEMPTS", 5u32)?,
            base_delay: Duration::from_millis(env.parse("PRODUCER_RETRY_BASE_MS", 100u64)?),
            max_delay: Duration::from_millis(env.parse("PRODUCER_RETRY_MAX_MS", 5_000u64)?),
        };
        if retry.max_attempts == 0 {
            return Err(env.invalid("PRODUCER_MAX_ATTEMPTS", "0"));
        }

        let refill_per_sec: f64 = env.parse("INGEST_REFILL_PER_SEC", 1.0)?;
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(env.invalid("INGEST_REFILL_PER_SEC", &refill_per_sec.to_string()));
        }

        Ok(Self {
            store: StoreConfig {
                backend: store_backend,
                redis_url: env.string("REDIS_URL", "redis://127.0.0.1:6379"),
                sqlite_path: env.string("SQLITE_STORE_PATH", "data/shared_store.db"),
                key_prefix: env.string("STORE_KEY_PREFIX", "moderation:"),
                connect_timeout: Duration::from_millis(env.parse("STORE_CONNECT_TIMEOUT_MS", 5_000u64)?),
            },
            broker: BrokerConfig {
                backend: broker_backend,
                brokers: env.string("KAFKA_BROKERS", "localhost:9092"),
                client_id: env.string("KAFKA_CLIENT_ID", "moderation-pipeline"),
                group_id: env.string("KAFKA_GROUP_ID", "moderation-workers"),
                connect_timeout: Duration::from_millis(env.parse("BROKER_CONNECT_TIMEOUT_MS", 10_000u64)?),
                poll_timeout: Duration::from_millis(env.parse("BROKER_POLL_TIMEOUT_MS", 500u64)?),
                partitions: env.parse("BROKER_PARTITIONS", 3usize)?,
            },
            topics: TopicConfig {
                raw_content: env.string("TOPIC_RAW_CONTENT", &topic_defaults.raw_content),
                moderation_results: env.string(
                    "TOPIC_MODERATION_RESULTS",
                    &topic_defaults.moderation_results,
                ),
                flagged_content: env.string("TOPIC_FLAGGED_CONTENT", &topic_defaults.flagged_content),
                dead_letter: env.string("TOPIC_DEAD_LETTER", &topic_defaults.dead_letter),
            },
            retry,
            ingest: IngestConfig {
                max_tokens: env.parse("INGEST_MAX_TOKENS", 10u32)?,
                refill_per_sec,
                stdin_enabled: env.parse("PIPELINE_STDIN_INGEST", false)?,
            },
            lag_monitor: LagMonitorConfig {
                interval: Duration::from_secs(env.parse("LAG_CHECK_INTERVAL_SECS", 30u64)?),
                lock_ttl_secs: env.parse("LAG_LOCK_TTL_SECS", 25u64)?,
                warn_threshold: env.parse("LAG_WARN_THRESHOLD", 1_000i64)?,
            },
            blocked_terms: env
                .string("BLOCKED_TERMS", "")
                .split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse::<T>()
                .map_err(|_| self.invalid(key, &value)),
        }
    }

    fn invalid(&self, key: &str, value: &str) -> ConfigError {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}
