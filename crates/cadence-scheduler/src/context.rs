//! Caller context: cancellation plus an optional deadline.
//!
//! Every externally-facing operation takes a [`CallContext`]. Background
//! loops build their own with a fixed per-cycle timeout.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never done unless cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A child context: cancelled together with `self`, but it can be
    /// cancelled on its own, and its deadline is the earlier of the two.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err` once the context is cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SchedulerError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves when the context is cancelled or its deadline passes, with
    /// the matching error.
    pub async fn done(&self) -> SchedulerError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => SchedulerError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => SchedulerError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                SchedulerError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        assert!(ctx.check().is_ok());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(ctx.check(), Err(SchedulerError::DeadlineExceeded)));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn cancellation_propagates_to_children() {
        let parent = CallContext::new();
        let child = parent.child(None);
        parent.cancel();
        assert!(matches!(child.check(), Err(SchedulerError::Cancelled)));
        assert!(matches!(child.done().await, SchedulerError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn child_takes_the_earlier_deadline() {
        let parent = CallContext::with_timeout(Duration::from_secs(10));
        let child = parent.child(Some(Duration::from_secs(60)));
        assert_eq!(child.deadline(), parent.deadline());

        let tight = parent.child(Some(Duration::from_secs(1)));
        assert!(tight.deadline() < parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn done_resolves_at_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        assert!(matches!(ctx.done().await, SchedulerError::DeadlineExceeded));
    }
}
