//! Context passed to monitor callbacks.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Deadline and cancellation state for a single monitor callback invocation.
///
/// Monitors are expected to check this context when doing anything potentially slow, and give up
/// once the deadline passes or the context is cancelled. Nothing is propagated back to the pool.
#[derive(Clone, Debug, Default)]
pub struct MonitorContext {
    /// Point in time the callback should be finished by.
    deadline: Option<Instant>,
    /// Cancellation token, triggered by an offloading dispatcher on budget overrun.
    token: CancellationToken,
}

impl MonitorContext {
    /// Context without any deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context expiring after `budget` from now.
    ///
    /// A budget too large to be represented as a point in time means no deadline.
    #[must_use]
    pub fn with_budget(budget: Duration) -> Self {
        Instant::now()
            .checked_add(budget)
            .map_or_else(Self::new, Self::with_deadline)
    }

    /// Context expiring at a fixed point in time.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            token: CancellationToken::new(),
        }
    }

    /// Context with an optional budget.
    #[must_use]
    pub(crate) fn from_budget(budget: Option<Duration>) -> Self {
        budget.map_or_else(Self::new, Self::with_budget)
    }

    /// Deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline.
    ///
    /// Returns [`None`] if there is no deadline, and [`Duration::ZERO`] if it has already passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed or the context was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether the context was explicitly cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancellation token, for use in async monitor code.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_deadline_never_done() {
        let ctx = MonitorContext::new();
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_done());
    }

    #[test]
    fn expired_deadline() {
        let ctx = MonitorContext::with_deadline(Instant::now());
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn budget_leaves_time() {
        let ctx = MonitorContext::with_budget(Duration::from_secs(60));
        assert!(!ctx.is_done());
        assert!(ctx.remaining().is_some_and(|r| r > Duration::from_secs(30)));
    }

    #[test]
    fn oversized_budget_means_no_deadline() {
        let ctx = MonitorContext::with_budget(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_done());
        let huge = Duration::from_secs(15_778_800_000_000_000_000);
        let ctx = MonitorContext::from_budget(Some(huge));
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let ctx = MonitorContext::from_budget(None);
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.is_done());
    }
}
