//! Command execution events.

mod reporter;

use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

pub use crate::{
    command::reporter::{CommandReporter, InFlightCommand, RequestIdGenerator},
    context::MonitorContext,
};

/// Failure description used when a command guard is dropped without an outcome.
pub const ABANDONED_FAILURE: &str = "command abandoned before completion";

/// Command is about to be sent to a server.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStartedEvent {
    /// Database the command runs against.
    pub database_name: String,
    /// Command name.
    pub command_name: String,
    /// Request identifier, shared with the matching terminal event.
    pub request_id: i64,
    /// Identifier of the connection carrying the command.
    pub connection_id: String,
}

/// Fields common to both command outcomes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFinishedEvent {
    /// Time between started and terminal reports.
    pub duration_nanos: u64,
    /// Command name.
    pub command_name: String,
    /// Request identifier of the matching started event.
    pub request_id: i64,
    /// Identifier of the connection that carried the command.
    pub connection_id: String,
}

impl CommandFinishedEvent {
    /// Command duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos)
    }
}

/// Command completed successfully.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CommandSucceededEvent {
    /// Common completion fields.
    #[serde(flatten)]
    pub finished: CommandFinishedEvent,
}

impl Deref for CommandSucceededEvent {
    type Target = CommandFinishedEvent;

    fn deref(&self) -> &Self::Target {
        &self.finished
    }
}

/// Command failed.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CommandFailedEvent {
    /// Common completion fields.
    #[serde(flatten)]
    pub finished: CommandFinishedEvent,
    /// Human-readable failure description.
    pub failure: String,
}

impl Deref for CommandFailedEvent {
    type Target = CommandFinishedEvent;

    fn deref(&self) -> &Self::Target {
        &self.finished
    }
}

/// Receiver of command events.
///
/// Every method defaults to a no-op, so implementors only override what they observe.
/// Implementations may be called concurrently for different commands.
pub trait CommandMonitor: Send + Sync {
    /// Command is about to be sent.
    fn started(&self, _ctx: &MonitorContext, _event: &CommandStartedEvent) {}

    /// Command completed successfully.
    fn succeeded(&self, _ctx: &MonitorContext, _event: &CommandSucceededEvent) {}

    /// Command failed.
    fn failed(&self, _ctx: &MonitorContext, _event: &CommandFailedEvent) {}
}

type Callback<E> = Arc<dyn Fn(&MonitorContext, &E) + Send + Sync>;

/// Set of independently optional command callbacks.
///
/// Empty slots are silent no-ops.
#[derive(Clone, Default)]
#[must_use]
pub struct CommandCallbacks {
    started: Option<Callback<CommandStartedEvent>>,
    succeeded: Option<Callback<CommandSucceededEvent>>,
    failed: Option<Callback<CommandFailedEvent>>,
}

impl CommandCallbacks {
    /// All slots empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set callback for command start.
    pub fn on_started<F>(mut self, f: F) -> Self
    where
        F: Fn(&MonitorContext, &CommandStartedEvent) + Send + Sync + 'static,
    {
        self.started = Some(Arc::new(f));
        self
    }

    /// Set callback for successful command completion.
    pub fn on_succeeded<F>(mut self, f: F) -> Self
    where
        F: Fn(&MonitorContext, &CommandSucceededEvent) + Send + Sync + 'static,
    {
        self.succeeded = Some(Arc::new(f));
        self
    }

    /// Set callback for failed command completion.
    pub fn on_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(&MonitorContext, &CommandFailedEvent) + Send + Sync + 'static,
    {
        self.failed = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for CommandCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCallbacks")
            .field("started", &self.started.is_some())
            .field("succeeded", &self.succeeded.is_some())
            .field("failed", &self.failed.is_some())
            .finish()
    }
}

impl CommandMonitor for CommandCallbacks {
    fn started(&self, ctx: &MonitorContext, event: &CommandStartedEvent) {
        if let Some(cb) = &self.started {
            cb(ctx, event);
        }
    }

    fn succeeded(&self, ctx: &MonitorContext, event: &CommandSucceededEvent) {
        if let Some(cb) = &self.succeeded {
            cb(ctx, event);
        }
    }

    fn failed(&self, ctx: &MonitorContext, event: &CommandFailedEvent) {
        if let Some(cb) = &self.failed {
            cb(ctx, event);
        }
    }
}
