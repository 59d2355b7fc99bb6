//! Concrete store and broker drivers, each behind its own feature

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "kafka")]
pub use self::kafka::KafkaBroker;
#[cfg(feature = "redis")]
pub use self::redis::{RedisConnection, RedisStore};
