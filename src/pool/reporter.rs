use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::warn;

use crate::{
    dispatch::Dispatcher,
    pool::{Event, EventType, MonitorPoolOptions, Reason},
};

/// Producer-side helper for the pool event channel of a single pool address.
///
/// Cheap to clone; clones share the closed state. Events are only constructed when a pool
/// monitor is registered.
///
/// Once [`PoolReporter::pool_closed`] is called, all further events are suppressed, except
/// checkout failures with [`Reason::PoolClosed`], which report callers using a closed pool.
#[derive(Clone, Debug)]
pub struct PoolReporter {
    address: Arc<str>,
    dispatcher: Dispatcher,
    closed: Arc<AtomicBool>,
}

impl PoolReporter {
    /// Create reporter for pool at `address`.
    #[must_use]
    pub fn new(address: impl Into<Arc<str>>, dispatcher: Dispatcher) -> Self {
        Self {
            address: address.into(),
            dispatcher,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pool network address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Linked dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Whether pool closure was already reported.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, event_type: EventType, make: impl FnOnce(&str) -> Event) {
        if self.is_closed() {
            warn!(
                pool.address = %self.address,
                pool.event = %event_type,
                "pool event after pool closure suppressed"
            );
            return;
        }
        self.dispatcher.pool_event(|| make(&self.address[..]));
    }

    /// Report pool creation.
    pub fn pool_created(&self, options: MonitorPoolOptions) {
        self.emit(EventType::PoolCreated, |addr| {
            Event::pool_created(addr, options)
        });
    }

    /// Report new connection.
    pub fn connection_created(&self, connection_id: u64) {
        self.emit(EventType::ConnectionCreated, |addr| {
            Event::connection_created(addr, connection_id)
        });
    }

    /// Report successful connection checkout.
    pub fn checked_out(&self, connection_id: u64) {
        self.emit(EventType::CheckedOut, |addr| {
            Event::checked_out(addr, connection_id)
        });
    }

    /// Report failed checkout attempt.
    pub fn check_out_failed(&self, reason: Reason) {
        if reason == Reason::PoolClosed {
            self.dispatcher
                .pool_event(|| Event::check_out_failed(&*self.address, reason));
        } else {
            self.emit(EventType::CheckOutFailed, |addr| {
                Event::check_out_failed(addr, reason)
            });
        }
    }

    /// Report connection returned to the pool.
    pub fn checked_in(&self, connection_id: u64) {
        self.emit(EventType::CheckedIn, |addr| {
            Event::checked_in(addr, connection_id)
        });
    }

    /// Report invalidation of all pool connections.
    pub fn pool_cleared(&self, reason: Reason) {
        self.emit(EventType::PoolCleared, |addr| {
            Event::pool_cleared(addr, reason)
        });
    }

    /// Report connection teardown.
    pub fn connection_closed(&self, connection_id: u64, reason: Reason) {
        self.emit(EventType::ConnectionClosed, |addr| {
            Event::connection_closed(addr, connection_id, reason)
        });
    }

    /// Report pool shutdown.
    ///
    /// Only the first call has any effect.
    pub fn pool_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            warn!(pool.address = %self.address, "duplicate pool closure suppressed");
            return;
        }
        self.dispatcher
            .pool_event(|| Event::pool_closed(&*self.address));
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn recording() -> (PoolReporter, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = Dispatcher::builder()
            .pool_monitor(move |e: &Event| sink.lock().push(e.clone()))
            .build();
        (PoolReporter::new("db1:27017", dispatcher), seen)
    }

    #[test]
    fn pool_created_carries_options() {
        let (reporter, seen) = recording();
        reporter.pool_created(MonitorPoolOptions::new(10, 2));
        assert_eq!(
            *seen.lock(),
            [Event::pool_created(
                "db1:27017",
                MonitorPoolOptions {
                    max_pool_size: 10,
                    min_pool_size: 2,
                }
            )]
        );
    }

    #[test]
    fn events_after_close_are_suppressed() {
        let (reporter, seen) = recording();
        reporter.pool_created(MonitorPoolOptions::new(1, 0));
        reporter.pool_closed();
        assert!(reporter.is_closed());
        reporter.connection_created(1);
        reporter.pool_cleared(Reason::Stale);
        reporter.check_out_failed(Reason::Timeout);
        reporter.pool_closed();
        let types: Vec<_> = seen.lock().iter().map(Event::event_type).collect();
        assert_eq!(types, [EventType::PoolCreated, EventType::PoolClosed]);
    }

    #[test]
    fn checkout_on_closed_pool_is_reported() {
        let (reporter, seen) = recording();
        reporter.pool_created(MonitorPoolOptions::new(1, 0));
        reporter.pool_closed();
        reporter.check_out_failed(Reason::PoolClosed);
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], Event::check_out_failed("db1:27017", Reason::PoolClosed));
    }

    #[test]
    fn clones_share_closed_state() {
        let (reporter, seen) = recording();
        let clone = reporter.clone();
        reporter.pool_closed();
        clone.checked_in(5);
        assert!(clone.is_closed());
        assert_eq!(seen.lock().len(), 1);
    }
}
