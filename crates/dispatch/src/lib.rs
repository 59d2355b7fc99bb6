//! # Herald Dispatch
//!
//! Deduplicated message dispatch. A [`Dispatcher`] checks a key-value store
//! for the message identifier, publishes to a broker only if it is unseen,
//! then records the identifier with a TTL. The store is reached only through
//! a [`herald_pool::Pool`] of connections.
//!
//! Every send ends in one [`Outcome`]: sent, skipped as a duplicate, or
//! failed with a [`DispatchError`] whose [`FailureReason`] says whether the
//! message was published. [`FailureReason::SentButUnrecorded`] is the one
//! partial failure: the broker has the message, the store does not know it.
//!
//! Drivers sit behind [`StoreDriver`] and [`BrokerDriver`]. Redis and Kafka
//! implementations live in [`drivers`] behind the `redis` and `kafka`
//! features; `testing` (feature `testing`) has in-memory ones with
//! programmable faults.
//!
//! ```no_run
//! # use herald_dispatch::{Config, Dispatcher, Message, Outcome};
//! # use herald_dispatch::testing::{MemoryStore, RecordingBroker};
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::from_config(
//!     MemoryStore::new(),
//!     RecordingBroker::new(),
//!     &Config::default(),
//! )?;
//! let ctx = herald_pool::Context::new();
//! match dispatcher.send(&ctx, &Message::new("hello")).await {
//!     Outcome::Sent(delivery) => println!("sent at {:?}", delivery.offset),
//!     Outcome::Skipped(_) => println!("duplicate"),
//!     Outcome::Failed(e) => eprintln!("{}: {e}", e.reason()),
//! }
//! dispatcher.shutdown(&ctx).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod message;
pub mod store;
#[cfg(feature = "testing")]
pub mod testing;

pub use config::{BrokerConfig, Config, DedupConfig, StoreConfig};
pub use dispatcher::{Dispatcher, Outcome, SkipReason};
pub use driver::{BrokerDriver, DriverError, StoreConnection, StoreDriver};
pub use error::{
    ConfigError, DispatchError, FailureReason, MessageError, ShutdownError, Stage, StoreError,
    StoreOperation,
};
pub use message::{DedupRecord, Delivery, Message, PayloadEncoding};
pub use store::{DedupStore, StoreResource};
