//! Call context with cancellation and deadline support

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Context for pool and driver operations.
///
/// Carries a cooperative cancellation token and an optional deadline. Every
/// blocking operation in the workspace takes a `&Context` so a caller-level
/// timeout or a shutdown can abort it at the next suspension point.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

/// Why a context-bound operation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    /// The cancellation token fired
    #[error("cancelled")]
    Cancelled,
    /// The deadline elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Context {
    /// Create a context with a fresh token and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Set an absolute deadline, keeping the earlier one if already set.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A context whose token is a child of this one.
    ///
    /// Cancelling the child does not cancel the parent.
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
        }
    }

    /// The cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Check whether the context is cancelled or past its deadline.
    pub fn interrupted(&self) -> Option<Interrupted> {
        if self.cancellation.is_cancelled() {
            Some(Interrupted::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Interrupted::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves when the context is cancelled or its deadline elapses.
    pub async fn done(&self) -> Interrupted {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.cancellation.cancelled() => Interrupted::Cancelled,
                () = tokio::time::sleep_until(deadline) => Interrupted::DeadlineExceeded,
            },
            None => {
                self.cancellation.cancelled().await;
                Interrupted::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context is interrupted first.
    ///
    /// On interruption `fut` is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        if let Some(reason) = self.interrupted() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            out = fut => Ok(out),
        }
    }
}
