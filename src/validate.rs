//! Validation of event streams against ordering guarantees.
//!
//! Producers are expected to never emit an invalid stream, so every violation found here is a
//! bug in the producing layer.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    command::{
        CommandFailedEvent, CommandFinishedEvent, CommandMonitor, CommandStartedEvent,
        CommandSucceededEvent, MonitorContext,
    },
    error::SequenceError,
    pool::{Event, EventType, PoolMonitor, Reason},
};

/// Known state of a single pool address.
///
/// Connection sets are emptied once the pool is closed.
#[derive(Debug, Default)]
struct AddressState {
    closed: bool,
    open: HashSet<u64>,
    closed_connections: HashSet<u64>,
}

impl AddressState {
    /// Mark pool closed, dropping connection bookkeeping.
    fn close(&mut self, address: &str) -> Result<(), SequenceError> {
        self.closed = true;
        self.closed_connections = HashSet::new();
        let mut unclosed: Vec<_> = std::mem::take(&mut self.open).into_iter().collect();
        if unclosed.is_empty() {
            return Ok(());
        }
        unclosed.sort_unstable();
        Err(SequenceError::UnclosedConnections {
            address: address.to_owned(),
            connection_ids: unclosed,
        })
    }
}

/// Checks pool events against per-address ordering guarantees.
///
/// - `ConnectionPoolCreated` comes first, and only once.
/// - Nothing but checkout failures with reason `poolClosed` follows `ConnectionPoolClosed`.
/// - Connection-scoped events refer to a created, not yet closed connection.
/// - Each connection is closed exactly once, before the pool is closed.
#[derive(Debug, Default)]
pub struct SequenceValidator {
    pools: HashMap<String, AddressState>,
}

impl SequenceValidator {
    /// Create empty validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed next event.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the event is malformed or violates ordering. Invalid events do not
    /// change the validator state, except for pool closure with connections still open: the pool
    /// is considered closed anyway.
    pub fn observe(&mut self, event: &Event) -> Result<(), SequenceError> {
        event.validate()?;
        let event_type = event.event_type();
        let address = event.address();
        if event_type == EventType::PoolCreated {
            if self.pools.contains_key(address) {
                return Err(SequenceError::DuplicatePoolCreated {
                    address: address.to_owned(),
                });
            }
            self.pools.insert(address.to_owned(), AddressState::default());
            return Ok(());
        }
        let Some(state) = self.pools.get_mut(address) else {
            return Err(SequenceError::BeforePoolCreated {
                address: address.to_owned(),
                event_type,
            });
        };
        let closed_pool_checkout =
            event_type == EventType::CheckOutFailed && event.reason() == Some(Reason::PoolClosed);
        if state.closed && !closed_pool_checkout {
            return Err(SequenceError::AfterPoolClosed {
                address: address.to_owned(),
                event_type,
            });
        }
        let Some(connection_id) = event.connection_id() else {
            if event_type == EventType::PoolClosed {
                return state.close(address);
            }
            return Ok(());
        };
        let known = state.open.contains(&connection_id);
        let was_closed = state.closed_connections.contains(&connection_id);
        let unknown = || SequenceError::UnknownConnection {
            address: address.to_owned(),
            connection_id,
            event_type,
        };
        let already_closed = || SequenceError::ConnectionAlreadyClosed {
            address: address.to_owned(),
            connection_id,
            event_type,
        };
        match event_type {
            EventType::ConnectionCreated if known || was_closed => {
                Err(SequenceError::DuplicateConnectionCreated {
                    address: address.to_owned(),
                    connection_id,
                })
            }
            EventType::ConnectionCreated => {
                state.open.insert(connection_id);
                Ok(())
            }
            _ if was_closed => Err(already_closed()),
            _ if !known => Err(unknown()),
            EventType::ConnectionClosed => {
                state.open.remove(&connection_id);
                state.closed_connections.insert(connection_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Connections created but not yet closed for `address`, in ascending order.
    #[must_use]
    pub fn open_connections(&self, address: &str) -> Vec<u64> {
        let mut ids: Vec<_> = self
            .pools
            .get(address)
            .map(|s| s.open.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Whether pool closure was observed for `address`.
    #[must_use]
    pub fn is_closed(&self, address: &str) -> bool {
        self.pools.get(address).is_some_and(|s| s.closed)
    }
}

/// Checks command events for start/terminal pairing.
#[derive(Debug, Default)]
pub struct CommandSequenceValidator {
    /// Connection identifiers of commands in flight, by request identifier.
    in_flight: HashMap<i64, String>,
}

impl CommandSequenceValidator {
    /// Create empty validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed started event.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a command with the same request identifier is already in flight.
    pub fn started(&mut self, event: &CommandStartedEvent) -> Result<(), SequenceError> {
        if self.in_flight.contains_key(&event.request_id) {
            return Err(SequenceError::DuplicateCommandStarted {
                request_id: event.request_id,
            });
        }
        self.in_flight
            .insert(event.request_id, event.connection_id.clone());
        Ok(())
    }

    /// Feed terminal event of either outcome.
    ///
    /// # Errors
    ///
    /// Returns `Err` if there is no command in flight with this request identifier, or if it was
    /// started on another connection.
    pub fn finished(&mut self, event: &CommandFinishedEvent) -> Result<(), SequenceError> {
        let Some(started) = self.in_flight.get(&event.request_id) else {
            return Err(SequenceError::CommandNotStarted {
                request_id: event.request_id,
            });
        };
        if *started != event.connection_id {
            return Err(SequenceError::CommandConnectionMismatch {
                request_id: event.request_id,
                started: started.clone(),
                finished: event.connection_id.clone(),
            });
        }
        self.in_flight.remove(&event.request_id);
        Ok(())
    }

    /// Number of commands started but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Maximum number of violations kept by [`ValidatingMonitor`].
pub const MAX_RECORDED_VIOLATIONS: usize = 1024;

/// Monitor validating both event channels.
///
/// Every violation is logged as a warning and counted. The first
/// [`MAX_RECORDED_VIOLATIONS`] are also kept for inspection.
#[derive(Debug, Default)]
pub struct ValidatingMonitor {
    pools: Mutex<SequenceValidator>,
    commands: Mutex<CommandSequenceValidator>,
    violations: Mutex<Violations>,
}

#[derive(Debug, Default)]
struct Violations {
    recorded: Vec<SequenceError>,
    total: u64,
}

impl ValidatingMonitor {
    /// Create new validating monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Violations found so far, up to [`MAX_RECORDED_VIOLATIONS`].
    #[must_use]
    pub fn violations(&self) -> Vec<SequenceError> {
        self.violations.lock().recorded.clone()
    }

    /// Number of violations found so far, including ones not kept.
    #[must_use]
    pub fn violation_count(&self) -> u64 {
        self.violations.lock().total
    }

    /// Connections created but not yet closed for `address`.
    #[must_use]
    pub fn open_connections(&self, address: &str) -> Vec<u64> {
        self.pools.lock().open_connections(address)
    }

    /// Number of commands started but not yet finished.
    #[must_use]
    pub fn commands_in_flight(&self) -> usize {
        self.commands.lock().in_flight()
    }

    fn record(&self, res: Result<(), SequenceError>) {
        if let Err(err) = res {
            warn!(%err, "invalid monitoring event sequence");
            let mut violations = self.violations.lock();
            violations.total += 1;
            if violations.recorded.len() < MAX_RECORDED_VIOLATIONS {
                violations.recorded.push(err);
            }
        }
    }
}

impl PoolMonitor for ValidatingMonitor {
    fn event(&self, event: &Event) {
        let res = self.pools.lock().observe(event);
        self.record(res);
    }
}

impl CommandMonitor for ValidatingMonitor {
    fn started(&self, _ctx: &MonitorContext, event: &CommandStartedEvent) {
        let res = self.commands.lock().started(event);
        self.record(res);
    }

    fn succeeded(&self, _ctx: &MonitorContext, event: &CommandSucceededEvent) {
        let res = self.commands.lock().finished(event);
        self.record(res);
    }

    fn failed(&self, _ctx: &MonitorContext, event: &CommandFailedEvent) {
        let res = self.commands.lock().finished(event);
        self.record(res);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::from_str;

    use super::*;
    use crate::{error::EventError, pool::MonitorPoolOptions};

    const ADDR: &str = "db1:27017";

    fn created() -> Event {
        Event::pool_created(ADDR, MonitorPoolOptions::new(10, 2))
    }

    #[test]
    fn full_lifecycle_is_valid() {
        let mut v = SequenceValidator::new();
        let events = [
            created(),
            Event::connection_created(ADDR, 1),
            Event::checked_out(ADDR, 1),
            Event::checked_in(ADDR, 1),
            Event::check_out_failed(ADDR, Reason::Timeout),
            Event::pool_cleared(ADDR, Reason::Stale),
            Event::connection_closed(ADDR, 1, Reason::Stale),
            Event::pool_closed(ADDR),
            Event::check_out_failed(ADDR, Reason::PoolClosed),
        ];
        for event in &events {
            assert_eq!(v.observe(event), Ok(()), "{event}");
        }
        assert!(v.is_closed(ADDR));
        assert!(v.open_connections(ADDR).is_empty());
    }

    #[test]
    fn pool_created_must_come_first() {
        let mut v = SequenceValidator::new();
        assert_eq!(
            v.observe(&Event::connection_created(ADDR, 1)),
            Err(SequenceError::BeforePoolCreated {
                address: ADDR.into(),
                event_type: EventType::ConnectionCreated,
            })
        );
        v.observe(&created()).unwrap();
        assert!(matches!(
            v.observe(&created()),
            Err(SequenceError::DuplicatePoolCreated { .. })
        ));
    }

    #[test]
    fn pool_closed_is_terminal() {
        let mut v = SequenceValidator::new();
        v.observe(&created()).unwrap();
        v.observe(&Event::pool_closed(ADDR)).unwrap();
        for event in [
            Event::connection_created(ADDR, 1),
            Event::check_out_failed(ADDR, Reason::Timeout),
            Event::pool_cleared(ADDR, Reason::PoolClosed),
            Event::pool_closed(ADDR),
        ] {
            assert!(
                matches!(v.observe(&event), Err(SequenceError::AfterPoolClosed { .. })),
                "{event}"
            );
        }
    }

    #[test]
    fn connections_close_exactly_once() {
        let mut v = SequenceValidator::new();
        v.observe(&created()).unwrap();
        assert!(matches!(
            v.observe(&Event::connection_closed(ADDR, 7, Reason::ConnectionError)),
            Err(SequenceError::UnknownConnection { connection_id: 7, .. })
        ));
        v.observe(&Event::connection_created(ADDR, 7)).unwrap();
        assert_eq!(v.open_connections(ADDR), [7]);
        v.observe(&Event::connection_closed(ADDR, 7, Reason::ConnectionError))
            .unwrap();
        assert!(matches!(
            v.observe(&Event::connection_closed(ADDR, 7, Reason::ConnectionError)),
            Err(SequenceError::ConnectionAlreadyClosed { connection_id: 7, .. })
        ));
        assert!(matches!(
            v.observe(&Event::checked_out(ADDR, 7)),
            Err(SequenceError::ConnectionAlreadyClosed { .. })
        ));
        assert!(matches!(
            v.observe(&Event::connection_created(ADDR, 7)),
            Err(SequenceError::DuplicateConnectionCreated { .. })
        ));
    }

    #[test]
    fn addresses_are_independent() {
        let mut v = SequenceValidator::new();
        v.observe(&created()).unwrap();
        v.observe(&Event::pool_closed(ADDR)).unwrap();
        v.observe(&Event::pool_created("db2:27017", MonitorPoolOptions::new(5, 0)))
            .unwrap();
        v.observe(&Event::connection_created("db2:27017", 1)).unwrap();
        assert!(!v.is_closed("db2:27017"));
    }

    #[test]
    fn malformed_event_is_rejected() {
        let mut v = SequenceValidator::new();
        let event: Event =
            from_str(r#"{"type": "ConnectionPoolCreated", "address": "h:1"}"#).unwrap();
        assert_eq!(
            v.observe(&event),
            Err(SequenceError::Malformed(EventError::MissingField {
                event_type: EventType::PoolCreated,
                field: "options",
            }))
        );
    }

    fn started(request_id: i64, conn: &str) -> CommandStartedEvent {
        CommandStartedEvent {
            database_name: "db".into(),
            command_name: "find".into(),
            request_id,
            connection_id: conn.into(),
        }
    }

    fn finished(request_id: i64, conn: &str) -> CommandFinishedEvent {
        CommandFinishedEvent {
            duration_nanos: 0,
            command_name: "find".into(),
            request_id,
            connection_id: conn.into(),
        }
    }

    #[test]
    fn command_pairs() {
        let mut v = CommandSequenceValidator::new();
        v.started(&started(1, "c1")).unwrap();
        v.started(&started(2, "c2")).unwrap();
        assert_eq!(v.in_flight(), 2);
        assert_eq!(
            v.started(&started(1, "c1")),
            Err(SequenceError::DuplicateCommandStarted { request_id: 1 })
        );
        assert_eq!(
            v.finished(&finished(2, "c1")),
            Err(SequenceError::CommandConnectionMismatch {
                request_id: 2,
                started: "c2".into(),
                finished: "c1".into(),
            })
        );
        v.finished(&finished(1, "c1")).unwrap();
        v.finished(&finished(2, "c2")).unwrap();
        assert_eq!(
            v.finished(&finished(2, "c2")),
            Err(SequenceError::CommandNotStarted { request_id: 2 })
        );
        assert_eq!(v.in_flight(), 0);
    }

    #[test]
    fn monitor_records_violations() {
        let monitor = ValidatingMonitor::new();
        monitor.event(&Event::checked_in(ADDR, 1));
        monitor.failed(
            &MonitorContext::new(),
            &CommandFailedEvent {
                finished: finished(9, "c1"),
                failure: "boom".into(),
            },
        );
        assert_eq!(
            monitor.violations(),
            [
                SequenceError::BeforePoolCreated {
                    address: ADDR.into(),
                    event_type: EventType::CheckedIn,
                },
                SequenceError::CommandNotStarted { request_id: 9 },
            ]
        );
        assert_eq!(monitor.commands_in_flight(), 0);
    }

    #[test]
    fn pool_closure_with_open_connections() {
        let mut v = SequenceValidator::new();
        v.observe(&created()).unwrap();
        for id in [3, 1, 2] {
            v.observe(&Event::connection_created(ADDR, id)).unwrap();
        }
        v.observe(&Event::connection_closed(ADDR, 2, Reason::PoolClosed))
            .unwrap();
        assert_eq!(
            v.observe(&Event::pool_closed(ADDR)),
            Err(SequenceError::UnclosedConnections {
                address: ADDR.into(),
                connection_ids: vec![1, 3],
            })
        );
        assert!(v.is_closed(ADDR));
        assert!(v.open_connections(ADDR).is_empty());
        let state = &v.pools[ADDR];
        assert!(state.closed_connections.is_empty());
        assert!(matches!(
            v.observe(&Event::checked_in(ADDR, 1)),
            Err(SequenceError::AfterPoolClosed { .. })
        ));
    }

    #[test]
    fn recorded_violations_are_capped() {
        let monitor = ValidatingMonitor::new();
        for _ in 0..MAX_RECORDED_VIOLATIONS + 10 {
            monitor.event(&Event::pool_closed(ADDR));
        }
        assert_eq!(monitor.violations().len(), MAX_RECORDED_VIOLATIONS);
        assert_eq!(
            monitor.violation_count(),
            u64::try_from(MAX_RECORDED_VIOLATIONS + 10).unwrap()
        );
    }
}
