//! Event logging via [`tracing`] crate.

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::{
    command::{
        CommandFailedEvent, CommandMonitor, CommandStartedEvent, CommandSucceededEvent,
        MonitorContext,
    },
    pool::{Event, PoolMonitor},
};

/// Target used for all event log records.
pub const LOG_TARGET: &str = "poolmon::events";

/// Severity used for event log output.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorLogLevel {
    /// Disables event logging altogether.
    #[serde(alias = "off", alias = "disabled", alias = "DISABLED")]
    Off,
    /// Log events at "error" level.
    #[serde(alias = "error", alias = "err", alias = "ERR")]
    Error,
    /// Log events at "warn" level.
    #[serde(alias = "warn", alias = "warning", alias = "WARNING")]
    Warn,
    /// Log events at "info" level.
    #[serde(alias = "info")]
    Info,
    /// Log events at "debug" level.
    #[serde(alias = "debug")]
    #[default]
    Debug,
    /// Log events at "trace" level.
    #[serde(alias = "trace")]
    Trace,
}

impl From<MonitorLogLevel> for LevelFilter {
    fn from(value: MonitorLogLevel) -> Self {
        match value {
            MonitorLogLevel::Off => LevelFilter::OFF,
            MonitorLogLevel::Error => LevelFilter::ERROR,
            MonitorLogLevel::Warn => LevelFilter::WARN,
            MonitorLogLevel::Info => LevelFilter::INFO,
            MonitorLogLevel::Debug => LevelFilter::DEBUG,
            MonitorLogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Emit tracing event at a level only known at runtime.
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            MonitorLogLevel::Off => {}
            MonitorLogLevel::Error => {
                tracing::event!(target: LOG_TARGET, tracing::Level::ERROR, $($arg)+)
            }
            MonitorLogLevel::Warn => {
                tracing::event!(target: LOG_TARGET, tracing::Level::WARN, $($arg)+)
            }
            MonitorLogLevel::Info => {
                tracing::event!(target: LOG_TARGET, tracing::Level::INFO, $($arg)+)
            }
            MonitorLogLevel::Debug => {
                tracing::event!(target: LOG_TARGET, tracing::Level::DEBUG, $($arg)+)
            }
            MonitorLogLevel::Trace => {
                tracing::event!(target: LOG_TARGET, tracing::Level::TRACE, $($arg)+)
            }
        }
    };
}

/// Monitor writing every pool and command event to the [`tracing`] subscriber.
///
/// Pool events additionally carry their serialized JSON form in the `json` field.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMonitor {
    level: MonitorLogLevel,
}

impl TracingMonitor {
    /// Create monitor logging at `level`.
    #[must_use]
    pub fn new(level: MonitorLogLevel) -> Self {
        Self { level }
    }

    /// Configured level.
    #[must_use]
    pub fn level(&self) -> MonitorLogLevel {
        self.level
    }
}

impl PoolMonitor for TracingMonitor {
    fn event(&self, event: &Event) {
        if self.level == MonitorLogLevel::Off {
            return;
        }
        let json = serde_json::to_string(event).unwrap_or_default();
        event_at!(
            self.level,
            pool.event = %event.event_type(),
            pool.address = event.address(),
            connection.id = event.connection_id(),
            reason = event.reason().map(|r| r.as_str()),
            json = %json,
            "pool event"
        );
    }
}

impl CommandMonitor for TracingMonitor {
    fn started(&self, _ctx: &MonitorContext, event: &CommandStartedEvent) {
        event_at!(
            self.level,
            db.namespace = %event.database_name,
            db.operation.name = %event.command_name,
            request.id = event.request_id,
            connection.id = %event.connection_id,
            "command started"
        );
    }

    fn succeeded(&self, _ctx: &MonitorContext, event: &CommandSucceededEvent) {
        event_at!(
            self.level,
            db.operation.name = %event.command_name,
            request.id = event.request_id,
            connection.id = %event.connection_id,
            duration_ns = event.duration_nanos,
            "command succeeded"
        );
    }

    fn failed(&self, _ctx: &MonitorContext, event: &CommandFailedEvent) {
        event_at!(
            self.level,
            db.operation.name = %event.command_name,
            request.id = event.request_id,
            connection.id = %event.connection_id,
            duration_ns = event.duration_nanos,
            failure = %event.failure,
            "command failed"
        );
    }
}
