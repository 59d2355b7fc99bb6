//! Pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::context::Context;
use crate::error::{Error, Result};

/// Configuration for resource pooling.
///
/// Durations are (de)serialized in humantime form (`"3s"`, `"10m"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on live instances (leased + idle)
    pub max_total: usize,
    /// Maximum number of idle instances kept for reuse
    pub max_idle: usize,
    /// Idle instances maintenance tries to keep warm.
    ///
    /// Like `validate_on_idle`, `idle_check_interval` and `max_idle_lifetime`,
    /// this only takes effect through `Pool::run_idle_cycle` or
    /// `Pool::spawn_maintenance`; a pool nobody maintains never warms up.
    pub min_idle: usize,
    /// Maximum wait for a free slot in `acquire`. `None` waits forever, zero
    /// never waits. Creating and validating instances are not bounded by it.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    /// Validate idle instances before handing them out
    pub validate_on_acquire: bool,
    /// Validate idle instances during maintenance cycles. No effect
    /// without maintenance.
    pub validate_on_idle: bool,
    /// Interval between `Pool::spawn_maintenance` cycles
    #[serde(with = "humantime_serde")]
    pub idle_check_interval: Duration,
    /// Idle instances unused for longer than this are evicted by
    /// maintenance cycles; `acquire` does not check it.
    #[serde(with = "humantime_serde")]
    pub max_idle_lifetime: Duration,
    /// Reuse the most recently returned instance first
    pub lifo: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 20,
            max_idle: 10,
            min_idle: 5,
            acquire_timeout: Some(Duration::from_secs(3)),
            validate_on_acquire: true,
            validate_on_idle: false,
            idle_check_interval: Duration::from_secs(30),
            max_idle_lifetime: Duration::from_secs(600),
            lifo: true,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_total == 0 {
            return Err(Error::configuration("max_total must be greater than 0"));
        }
        if self.max_idle > self.max_total {
            return Err(Error::configuration(format!(
                "max_idle ({}) must not exceed max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.min_idle > self.max_idle {
            return Err(Error::configuration(format!(
                "min_idle ({}) must not exceed max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        if self.idle_check_interval.is_zero() {
            return Err(Error::configuration(
                "idle_check_interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Set `max_total`.
    pub fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }

    /// Set `max_idle` and `min_idle` together.
    pub fn with_idle(mut self, min_idle: usize, max_idle: usize) -> Self {
        self.min_idle = min_idle;
        self.max_idle = max_idle;
        self
    }

    /// Set the acquire timeout (`None` waits forever).
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Toggle borrow-time validation.
    pub fn with_validate_on_acquire(mut self, enabled: bool) -> Self {
        self.validate_on_acquire = enabled;
        self
    }

    /// Toggle idle validation during maintenance.
    pub fn with_validate_on_idle(mut self, enabled: bool) -> Self {
        self.validate_on_idle = enabled;
        self
    }

    /// The instant `acquire` must give up, combining the pool timeout with
    /// the caller's deadline. `None` means wait forever.
    pub(crate) fn acquire_deadline(&self, started: Instant, ctx: &Context) -> Option<Instant> {
        let pool = self.acquire_timeout.map(|t| started + t);
        match (pool, ctx.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
