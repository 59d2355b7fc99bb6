//! Deduplicated dispatch: check, publish, record
//!
//! ```text
//! exists(id) ──true──▶ Skipped(Duplicate)
//!     │ false
//!     ▼
//! publish(id, payload) ──err──▶ Failed(BrokerUnavailable)   nothing recorded
//!     │ ok
//!     ▼
//! record(id, ttl) ──err──▶ Failed(SentButUnrecorded)       already published
//!     │ ok
//!     ▼
//! Sent(delivery)
//! ```
//!
//! Two concurrent sends of the same identifier can both pass the check and
//! both publish. Enable per-identifier locking to serialize them within one
//! dispatcher; nothing coordinates separate processes.

use std::hash::{BuildHasher, RandomState};
use std::time::Duration;

use herald_pool::{Context, PoolStats};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{Config, DEFAULT_TTL};
use crate::driver::{BrokerDriver, StoreDriver};
use crate::error::{ConfigError, DispatchError, FailureReason, ShutdownError, Stage, StoreError};
use crate::message::{Delivery, Message, PayloadEncoding};
use crate::store::DedupStore;

/// Why a send was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The identifier is already recorded
    Duplicate,
}

/// Terminal state of one send.
#[must_use]
#[derive(Debug)]
pub enum Outcome {
    Sent(Delivery),
    Skipped(SkipReason),
    Failed(DispatchError),
}

impl Outcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Failed(e) => Some(e.reason()),
            _ => None,
        }
    }

    /// `Ok(Some(delivery))` when sent, `Ok(None)` when skipped.
    pub fn into_result(self) -> Result<Option<Delivery>, DispatchError> {
        match self {
            Self::Sent(delivery) => Ok(Some(delivery)),
            Self::Skipped(_) => Ok(None),
            Self::Failed(e) => Err(e),
        }
    }
}

/// Fixed table of async mutexes keyed by identifier hash.
struct KeyLocks {
    shards: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl KeyLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    async fn lock(&self, identifier: &str) -> MutexGuard<'_, ()> {
        let hash = self.hasher.hash_one(identifier);
        let index = (hash % self.shards.len() as u64) as usize;
        self.shards[index].lock().await
    }
}

/// Sends messages at most once per identifier, within the record TTL.
pub struct Dispatcher<D: StoreDriver, B: BrokerDriver> {
    store: DedupStore<D>,
    broker: B,
    ttl: Duration,
    encoding: PayloadEncoding,
    locks: Option<KeyLocks>,
}

impl<D: StoreDriver, B: BrokerDriver> Dispatcher<D, B> {
    /// Dispatcher with a seven-day TTL, raw payloads and no locking.
    pub fn new(store: DedupStore<D>, broker: B) -> Self {
        Self {
            store,
            broker,
            ttl: DEFAULT_TTL,
            encoding: PayloadEncoding::Raw,
            locks: None,
        }
    }

    /// Validate `config` and build the store pool and dispatcher from it.
    ///
    /// No maintenance task is started: `min_idle`, `validate_on_idle` and
    /// `max_idle_lifetime` stay inert until [`Dispatcher::spawn_maintenance`]
    /// is called.
    pub fn from_config(store: D, broker: B, config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = DedupStore::with_config(store, config.pool.clone(), &config.store)?;
        let dispatcher = Self::new(store, broker)
            .with_ttl(config.dedup.ttl)
            .with_encoding(config.broker.encoding);
        Ok(if config.dedup.per_identifier_locking {
            dispatcher.with_identifier_locking(config.dedup.lock_shards)
        } else {
            dispatcher
        })
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Serialize check, publish and record per identifier (hash-sharded).
    #[must_use]
    pub fn with_identifier_locking(mut self, shards: usize) -> Self {
        self.locks = Some(KeyLocks::new(shards));
        self
    }

    /// Publish `message` unless its identifier was already recorded.
    pub async fn send(&self, ctx: &Context, message: &Message) -> Outcome {
        let span = info_span!("dispatch", identifier = %message.identifier());
        self.dispatch(ctx, message, true).instrument(span).await
    }

    /// Publish `message` without the existence check, then record it.
    pub async fn send_unchecked(&self, ctx: &Context, message: &Message) -> Outcome {
        let span = info_span!("dispatch", identifier = %message.identifier(), unchecked = true);
        self.dispatch(ctx, message, false).instrument(span).await
    }

    /// Whether `identifier` has been recorded.
    pub async fn exists(&self, ctx: &Context, identifier: &str) -> Result<bool, StoreError> {
        self.store.exists(ctx, identifier).await
    }

    /// Drop the record for `identifier` so it can be sent again.
    pub async fn forget(&self, ctx: &Context, identifier: &str) -> Result<bool, StoreError> {
        self.store.remove(ctx, identifier).await
    }

    /// Close the broker, then the store pool.
    ///
    /// Both are attempted; the broker error wins if both fail.
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), ShutdownError> {
        let broker = self.broker.close(ctx).await;
        let store = self.store.shutdown(ctx).await;
        match (broker, store) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), store) => {
                if let Err(store) = store {
                    warn!(error = %store, "dedup store shutdown failed");
                }
                Err(ShutdownError::Broker(e))
            }
            (Ok(()), Err(e)) => Err(ShutdownError::Store(e)),
        }
    }

    /// Start idle maintenance on the store pool.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        self.store.pool().spawn_maintenance()
    }

    pub fn stats(&self) -> PoolStats {
        self.store.stats()
    }

    pub fn store(&self) -> &DedupStore<D> {
        &self.store
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    async fn dispatch(&self, ctx: &Context, message: &Message, check: bool) -> Outcome {
        let identifier = message.identifier();

        let payload = match message.encode(self.encoding) {
            Ok(payload) => payload,
            Err(source) => {
                warn!(error = %source, "message cannot be encoded");
                return Outcome::Failed(DispatchError::InvalidMessage {
                    identifier: identifier.to_string(),
                    source,
                });
            }
        };

        let _guard = match &self.locks {
            Some(locks) => match ctx.run(locks.lock(identifier)).await {
                Ok(guard) => Some(guard),
                Err(reason) => {
                    return Outcome::Failed(DispatchError::Cancelled {
                        identifier: identifier.to_string(),
                        stage: Stage::Check,
                        reason,
                    });
                }
            },
            None => None,
        };

        if check {
            match self.store.exists(ctx, identifier).await {
                Ok(true) => {
                    info!("already sent, skipping");
                    return Outcome::Skipped(SkipReason::Duplicate);
                }
                Ok(false) => {}
                Err(source) => {
                    let err = match ctx.interrupted() {
                        Some(reason) => DispatchError::Cancelled {
                            identifier: identifier.to_string(),
                            stage: Stage::Check,
                            reason,
                        },
                        None => {
                            warn!(error = %source, "dedup check failed, not sending");
                            DispatchError::StoreUnavailable {
                                identifier: identifier.to_string(),
                                source,
                            }
                        }
                    };
                    return Outcome::Failed(err);
                }
            }
        }

        let delivery = match ctx.run(self.broker.publish(ctx, identifier, payload)).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(source)) => {
                warn!(broker = self.broker.name(), error = %source, "publish failed");
                return Outcome::Failed(DispatchError::BrokerUnavailable {
                    identifier: identifier.to_string(),
                    source,
                });
            }
            Err(reason) => {
                return Outcome::Failed(DispatchError::Cancelled {
                    identifier: identifier.to_string(),
                    stage: Stage::Publish,
                    reason,
                });
            }
        };

        match self.store.record(ctx, identifier, self.ttl).await {
            Ok(_) => {
                info!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "sent"
                );
                Outcome::Sent(delivery)
            }
            Err(source) => {
                error!(
                    error = %source,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "sent but not recorded, a retry will send it again"
                );
                Outcome::Failed(DispatchError::SentButUnrecorded {
                    identifier: identifier.to_string(),
                    delivery,
                    source,
                })
            }
        }
    }
}
