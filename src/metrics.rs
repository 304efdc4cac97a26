//! OpenTelemetry metrics derived from monitoring events.

use std::{collections::HashMap, fmt, time::Instant};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter},
    Key, KeyValue,
};
use parking_lot::Mutex;

use crate::{
    command::{
        CommandFailedEvent, CommandFinishedEvent, CommandMonitor, CommandStartedEvent,
        CommandSucceededEvent, MonitorContext,
    },
    pool::{Event, EventType, PoolMonitor},
};

const KEY_POOL_NAME: Key = Key::from_static_str("db.client.connection.pool.name");
const KEY_STATE: Key = Key::from_static_str("db.client.connection.state");
const KEY_EVENT_TYPE: Key = Key::from_static_str("event.type");
const KEY_REASON: Key = Key::from_static_str("reason");
const KEY_OPERATION: Key = Key::from_static_str("db.operation.name");
const KEY_NAMESPACE: Key = Key::from_static_str("db.namespace");
const KEY_OUTCOME: Key = Key::from_static_str("db.response.outcome");

/// Monitor recording pool and command metrics.
///
/// Every pool is labelled by its address.
pub struct MetricsMonitor {
    /// The number of connections that are currently in state described by the state attribute.
    conn_count: UpDownCounter<i64>,
    /// The maximum number of open connections allowed.
    conn_max: Gauge<u64>,
    /// The minimum number of open connections kept in the pool.
    idle_min: Gauge<u64>,
    /// Number of pool events, by type and reason.
    events: Counter<u64>,
    /// The time between borrowing a connection and returning it to the pool.
    use_time: Histogram<f64>,
    /// Duration of database client operations.
    op_duration: Histogram<f64>,
    /// Checkout times, by pool address and connection identifier.
    checkouts: Mutex<HashMap<(String, u64), Instant>>,
    /// Database names of commands in flight, by connection and request identifiers.
    namespaces: Mutex<HashMap<(String, i64), String>>,
}

impl Default for MetricsMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricsMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsMonitor")
            .field("checked_out", &self.checkouts.lock().len())
            .field("commands_in_flight", &self.namespaces.lock().len())
            .finish_non_exhaustive()
    }
}

impl MetricsMonitor {
    /// Create metrics monitor using the global meter provider.
    #[must_use]
    pub fn new() -> Self {
        Self::with_meter(&global::meter("poolmon"))
    }

    /// Create metrics monitor using a specific meter.
    #[must_use]
    pub fn with_meter(meter: &Meter) -> Self {
        // db.client.connection.pool.name (string)
        // db.client.connection.state (total / used)
        let conn_count = meter
            .i64_up_down_counter("db.client.connection.count")
            .with_description(concat!(
                "The number of connections that are currently in state described by the state ",
                "attribute.",
            ))
            .build();
        // db.client.connection.pool.name (string)
        let conn_max = meter
            .u64_gauge("db.client.connection.max")
            .with_description("The maximum number of open connections allowed.")
            .build();
        // db.client.connection.pool.name (string)
        let idle_min = meter
            .u64_gauge("db.client.connection.idle.min")
            .with_description("The minimum number of idle open connections allowed.")
            .build();
        // db.client.connection.pool.name (string)
        // event.type (string, event type)
        // reason (string, optional)
        let events = meter
            .u64_counter("db.client.connection.events")
            .with_description("The number of connection pool events.")
            .build();
        // db.client.connection.pool.name (string)
        let use_time = meter
            .f64_histogram("db.client.connection.use_time")
            .with_unit("s")
            .with_description(
                "The time between borrowing a connection and returning it to the pool.",
            )
            .build();
        // db.operation.name (string, command)
        // db.namespace (string, database)
        // db.response.outcome (success / failure)
        let op_duration = meter
            .f64_histogram("db.client.operation.duration")
            .with_unit("s")
            .with_description("Duration of database client operations.")
            .build();
        Self {
            conn_count,
            conn_max,
            idle_min,
            events,
            use_time,
            op_duration,
            checkouts: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Forget checkout of a connection, returning its checkout time.
    ///
    /// The "used" connection count mirrors the checkouts tracked here.
    fn release(&self, address: &str, connection_id: u64) -> Option<Instant> {
        self.checkouts
            .lock()
            .remove(&(address.to_owned(), connection_id))
    }

    fn record_finished(&self, event: &CommandFinishedEvent, outcome: &'static str) {
        let namespace = self
            .namespaces
            .lock()
            .remove(&(event.connection_id.clone(), event.request_id));
        let mut labels = vec![
            KeyValue::new(KEY_OPERATION, event.command_name.clone()),
            KeyValue::new(KEY_OUTCOME, outcome),
        ];
        if let Some(ns) = namespace {
            labels.push(KeyValue::new(KEY_NAMESPACE, ns));
        }
        self.op_duration
            .record(event.duration().as_secs_f64(), &labels);
    }
}

fn pool_kv(address: &str) -> KeyValue {
    KeyValue::new(KEY_POOL_NAME, address.to_owned())
}

fn status_kv(pool: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [pool, KeyValue::new(KEY_STATE, status)]
}

impl PoolMonitor for MetricsMonitor {
    fn event(&self, event: &Event) {
        let pool = pool_kv(event.address());
        let mut labels = vec![
            pool.clone(),
            KeyValue::new(KEY_EVENT_TYPE, event.event_type().as_str()),
        ];
        if let Some(reason) = event.reason() {
            labels.push(KeyValue::new(KEY_REASON, reason.as_str()));
        }
        self.events.add(1, &labels);

        match (event.event_type(), event.connection_id()) {
            (EventType::PoolCreated, _) => {
                if let Some(opts) = event.pool_options() {
                    let label = [pool];
                    self.conn_max.record(opts.max_pool_size, &label);
                    self.idle_min.record(opts.min_pool_size, &label);
                }
            }
            (EventType::ConnectionCreated, Some(_)) => {
                self.conn_count.add(1, &status_kv(pool, "total"));
            }
            (EventType::CheckedOut, Some(id)) => {
                let previous = self
                    .checkouts
                    .lock()
                    .insert((event.address().to_owned(), id), Instant::now());
                if previous.is_none() {
                    self.conn_count.add(1, &status_kv(pool, "used"));
                }
            }
            (EventType::CheckedIn, Some(id)) => {
                if let Some(at) = self.release(event.address(), id) {
                    self.use_time
                        .record(at.elapsed().as_secs_f64(), &[pool.clone()]);
                    self.conn_count.add(-1, &status_kv(pool, "used"));
                }
            }
            (EventType::ConnectionClosed, Some(id)) => {
                if self.release(event.address(), id).is_some() {
                    self.conn_count.add(-1, &status_kv(pool.clone(), "used"));
                }
                self.conn_count.add(-1, &status_kv(pool, "total"));
            }
            _ => {}
        }
    }
}

impl CommandMonitor for MetricsMonitor {
    fn started(&self, _ctx: &MonitorContext, event: &CommandStartedEvent) {
        self.namespaces.lock().insert(
            (event.connection_id.clone(), event.request_id),
            event.database_name.clone(),
        );
    }

    fn succeeded(&self, _ctx: &MonitorContext, event: &CommandSucceededEvent) {
        self.record_finished(event, "success");
    }

    fn failed(&self, _ctx: &MonitorContext, event: &CommandFailedEvent) {
        self.record_finished(event, "failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MonitorPoolOptions, Reason};

    fn finished(request_id: i64) -> CommandFinishedEvent {
        CommandFinishedEvent {
            duration_nanos: 2_000_000,
            command_name: "find".into(),
            request_id,
            connection_id: "c1".into(),
        }
    }

    #[test]
    fn checkout_bookkeeping_is_released() {
        let monitor = MetricsMonitor::new();
        let used = |m: &MetricsMonitor| m.checkouts.lock().len();
        monitor.event(&Event::pool_created("h:1", MonitorPoolOptions::new(10, 2)));
        monitor.event(&Event::connection_created("h:1", 1));
        monitor.event(&Event::connection_created("h:1", 2));
        monitor.event(&Event::checked_out("h:1", 1));
        monitor.event(&Event::checked_out("h:1", 2));
        monitor.event(&Event::checked_out("h:1", 2));
        assert_eq!(used(&monitor), 2);
        monitor.event(&Event::checked_in("h:1", 1));
        assert_eq!(used(&monitor), 1);
        monitor.event(&Event::checked_in("h:1", 1));
        assert_eq!(used(&monitor), 1);
        monitor.event(&Event::connection_closed("h:1", 2, Reason::ConnectionError));
        assert_eq!(used(&monitor), 0);
        assert!(monitor.release("h:1", 2).is_none());
        monitor.event(&Event::check_out_failed("h:1", Reason::Timeout));
        assert_eq!(used(&monitor), 0);
    }

    #[test]
    fn command_namespace_is_released() {
        let monitor = MetricsMonitor::new();
        let ctx = MonitorContext::new();
        for request_id in [1, 2] {
            monitor.started(
                &ctx,
                &CommandStartedEvent {
                    database_name: "db".into(),
                    command_name: "find".into(),
                    request_id,
                    connection_id: "c1".into(),
                },
            );
        }
        assert_eq!(monitor.namespaces.lock().len(), 2);
        monitor.succeeded(&ctx, &CommandSucceededEvent { finished: finished(1) });
        monitor.failed(
            &ctx,
            &CommandFailedEvent {
                finished: finished(2),
                failure: "boom".into(),
            },
        );
        assert!(monitor.namespaces.lock().is_empty());
        assert_eq!(
            format!("{monitor:?}"),
            "MetricsMonitor { checked_out: 0, commands_in_flight: 0, .. }"
        );
    }
}
