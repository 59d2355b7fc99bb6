//! Idle maintenance: eviction, idle validation and `min_idle` warm-up
//!
//! A cycle only ever touches instances sitting in the idle queue. Leased
//! instances are never inspected; they are dealt with when they come back.

use std::collections::VecDeque;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::Error;
use crate::pool::{Pool, SlotReservation, Validation};
use crate::resource::{Resource, ResourceState};

/// Outcome of one maintenance cycle.
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    /// Idle instances evicted for exceeding `max_idle_lifetime`
    pub evicted: usize,
    /// Idle instances that passed validation
    pub validated: usize,
    /// Idle instances destroyed after failing validation
    pub invalidated: usize,
    /// Instances created to reach `min_idle`
    pub created: usize,
    /// Validation and creation failures seen during the cycle
    pub failures: Vec<Error>,
}

impl MaintenanceReport {
    /// True when the cycle changed nothing.
    pub fn is_empty(&self) -> bool {
        self.evicted == 0 && self.invalidated == 0 && self.created == 0 && self.failures.is_empty()
    }
}

impl<R: Resource> Pool<R> {
    /// Run one maintenance cycle.
    ///
    /// 1. Evict idle instances unused for longer than `max_idle_lifetime`.
    /// 2. If `validate_on_idle` is set, validate each remaining idle instance
    ///    and destroy the ones that fail.
    /// 3. Create instances until the idle queue holds `min_idle`, without
    ///    exceeding `max_total`. A creation failure stops this step and is
    ///    recorded in the report; it is not returned as an error.
    pub async fn run_idle_cycle(&self, ctx: &Context) -> MaintenanceReport {
        let shared = &*self.inner;
        let config = &shared.config;
        let mut report = MaintenanceReport::default();

        // 1. eviction
        let now = Instant::now();
        let expired = {
            let mut state = shared.state.lock();
            if state.closed {
                return report;
            }
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|entry| entry.idle_for(now) <= config.max_idle_lifetime);
            state.idle = keep;
            state.size = state.size.saturating_sub(expired.len());
            expired
        };
        if !expired.is_empty() {
            shared.released.notify_waiters();
        }
        for entry in expired {
            report.evicted += 1;
            shared.destroy(entry).await;
        }

        // 2. idle validation, oldest first
        if config.validate_on_idle {
            let candidates = shared.state.lock().idle.len();
            for _ in 0..candidates {
                let entry = shared.state.lock().idle.pop_front();
                let Some(entry) = entry else { break };
                match shared.validate_entry(entry, ctx).await {
                    Validation::Passed(entry) => {
                        report.validated += 1;
                        shared.return_idle(entry).await;
                    }
                    Validation::Failed(err) => {
                        report.invalidated += 1;
                        report.failures.push(err);
                    }
                    Validation::Interrupted(entry) => {
                        shared.return_idle(entry).await;
                        return report;
                    }
                }
            }
        }

        // 3. warm up to min_idle
        loop {
            let reserved = {
                let mut state = shared.state.lock();
                let reserve = !state.closed
                    && state.idle.len() < config.min_idle
                    && state.size < config.max_total;
                if reserve {
                    state.size += 1;
                }
                reserve
            };
            if !reserved {
                break;
            }
            let slot = SlotReservation::new(shared);

            let instance = match ctx.run(shared.resource.create(ctx)).await {
                Ok(Ok(instance)) => instance,
                Ok(Err(e)) => {
                    shared.record_creation_failure(&e);
                    report.failures.push(Error::creation(shared.resource.id(), e));
                    break;
                }
                Err(_) => break,
            };

            let mut entry = shared.new_entry(instance);
            entry.transition(ResourceState::Idle);
            let rejected = {
                let mut state = shared.state.lock();
                if state.closed {
                    Some(entry)
                } else {
                    state.idle.push_back(entry);
                    None
                }
            };
            match rejected {
                None => {
                    slot.commit();
                    report.created += 1;
                    shared.released.notify_waiters();
                }
                Some(entry) => {
                    drop(slot);
                    shared.destroy(entry).await;
                    break;
                }
            }
        }

        if !report.is_empty() {
            debug!(
                pool = shared.resource.id(),
                evicted = report.evicted,
                validated = report.validated,
                invalidated = report.invalidated,
                created = report.created,
                failures = report.failures.len(),
                "maintenance cycle finished"
            );
        }
        report
    }

    /// Spawn a background task running [`run_idle_cycle`](Self::run_idle_cycle)
    /// every `idle_check_interval`. The first cycle runs immediately.
    ///
    /// The task stops when the pool is shut down.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let shutdown = pool.inner.shutdown.clone();
            let ctx = Context::new().with_cancellation(shutdown.child_token());
            let mut ticker = tokio::time::interval(pool.inner.config.idle_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let report = pool.run_idle_cycle(&ctx).await;
                for failure in &report.failures {
                    if matches!(failure, Error::ResourceCreationFailed { .. }) {
                        warn!(
                            pool = pool.inner.resource.id(),
                            error = %failure,
                            "could not warm pool to min_idle"
                        );
                    }
                }
            }
            debug!(pool = pool.inner.resource.id(), "maintenance task stopped");
        })
    }
}
