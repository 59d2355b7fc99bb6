//! Dispatcher configuration
//!
//! Every section is `#[serde(default)]`, so an empty document yields the
//! defaults. Durations use humantime form (`"2s"`, `"7d"`).

use std::time::Duration;

use herald_pool::PoolConfig;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::message::PayloadEncoding;

/// Default dedup key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "message:uuid:";

/// Default dedup record lifetime: seven days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(604_800);

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub dedup: DedupConfig,
}

impl Config {
    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.store.validate()?;
        self.broker.validate()?;
        self.dedup.validate()
    }
}

/// Key-value store connection settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URL
    pub endpoint: String,
    pub username: Option<String>,
    /// Redacted in `Debug`
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    /// Logical database index
    pub database: Option<i64>,
    /// Prefix prepended to every identifier
    pub key_prefix: String,
    /// Upper bound on opening one connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound on one store call; `None` relies on the caller's context
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "redis://127.0.0.1:6379".to_string(),
            username: None,
            password: None,
            database: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Some(Duration::from_secs(2)),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("store", "endpoint cannot be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("store", "connect_timeout must be greater than zero"));
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("store", "operation_timeout must be greater than zero"));
        }
        Ok(())
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

/// Broker producer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bootstrap servers, comma-separated
    pub endpoint: String,
    pub topic: String,
    /// Acknowledgements required: `0`, `1` or `all`
    pub acks: String,
    pub retries: u32,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub linger: Duration,
    /// Upper bound on one publish, including client retries
    #[serde(with = "humantime_serde")]
    pub delivery_timeout: Duration,
    pub encoding: PayloadEncoding,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9092".to_string(),
            topic: "messages".to_string(),
            acks: "all".to_string(),
            retries: 3,
            batch_size: 16384,
            linger: Duration::from_millis(1),
            delivery_timeout: Duration::from_secs(30),
            encoding: PayloadEncoding::default(),
        }
    }
}

impl BrokerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("broker", "endpoint cannot be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::invalid("broker", "topic cannot be empty"));
        }
        if !matches!(self.acks.as_str(), "0" | "1" | "all" | "-1") {
            return Err(ConfigError::invalid(
                "broker",
                format!("acks must be 0, 1 or all, got '{}'", self.acks),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("broker", "batch_size cannot be zero"));
        }
        Ok(())
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a sent identifier is remembered
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Serialize check, publish and record per identifier
    pub per_identifier_locking: bool,
    /// Lock table size when locking is enabled
    pub lock_shards: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            per_identifier_locking: false,
            lock_shards: 64,
        }
    }
}

impl DedupConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.as_secs() == 0 {
            return Err(ConfigError::invalid("dedup", "ttl must be at least one second"));
        }
        if self.lock_shards == 0 {
            return Err(ConfigError::invalid("dedup", "lock_shards cannot be zero"));
        }
        Ok(())
    }
}
