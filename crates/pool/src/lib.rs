//! # Herald Pool
//!
//! Generic, thread-safe pool of homogeneous, expensive-to-create resources
//! with borrow-time validation.
//!
//! - [`Resource`] describes how to create, validate and clean up an instance.
//! - [`Pool`] owns the instances and hands out exclusive [`Lease`]s.
//! - [`Context`] carries cancellation and a deadline into every blocking call.
//!
//! Acquisition distinguishes *exhaustion* (nothing became free in time) from
//! *creation failure* (the downstream system refused a new connection); see
//! [`ErrorKind`]. A resource that fails validation is discarded and the
//! acquisition carries on, so a stale connection never surfaces as an error
//! on its own.
//!
//! ```no_run
//! # use herald_pool::{Context, Pool, PoolConfig, Resource};
//! # async fn demo<R: Resource>(resource: R) -> herald_pool::Result<()> {
//! let pool = Pool::new(resource, PoolConfig::default())?;
//! let ctx = Context::new();
//! let lease = pool.acquire(&ctx).await?;
//! // use `*lease` ...
//! lease.release();
//! pool.shutdown(&ctx).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod lease;
pub mod maintenance;
pub mod pool;
pub mod resource;

pub use config::PoolConfig;
pub use context::{Context, Interrupted};
pub use error::{BoxError, Error, ErrorKind, Result};
pub use lease::Lease;
pub use maintenance::MaintenanceReport;
pub use pool::{Pool, PoolStats};
pub use resource::{Resource, ResourceId, ResourceInfo, ResourceState};
