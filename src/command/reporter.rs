use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    command::{
        CommandFailedEvent, CommandFinishedEvent, CommandStartedEvent, CommandSucceededEvent,
        ABANDONED_FAILURE,
    },
    dispatch::Dispatcher,
};

/// Source of monotonically increasing request identifiers.
///
/// The first identifier handed out is `1`.
#[derive(Debug, Default)]
pub struct RequestIdGenerator(AtomicI64);

impl RequestIdGenerator {
    /// Create new generator.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Get next request identifier.
    pub fn next_id(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Producer-side helper for the command event channel.
///
/// Pairs every started event with exactly one terminal event, and measures command duration.
#[derive(Clone, Debug, Default)]
pub struct CommandReporter {
    dispatcher: Dispatcher,
    ids: Arc<RequestIdGenerator>,
}

impl CommandReporter {
    /// Create reporter delivering to `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            ids: Arc::new(RequestIdGenerator::new()),
        }
    }

    /// Linked dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Allocate next request identifier.
    pub fn next_request_id(&self) -> i64 {
        self.ids.next_id()
    }

    /// Report command start, assigning a fresh request identifier.
    pub fn start(&self, database: &str, command: &str, connection_id: &str) -> InFlightCommand {
        self.start_with_id(self.next_request_id(), database, command, connection_id)
    }

    /// Report command start using a request identifier chosen by the caller.
    ///
    /// The caller is responsible for identifier uniqueness.
    pub fn start_with_id(
        &self,
        request_id: i64,
        database: &str,
        command: &str,
        connection_id: &str,
    ) -> InFlightCommand {
        if !self.dispatcher.has_command_monitor() {
            return InFlightCommand {
                request_id,
                pending: None,
            };
        }
        self.dispatcher.command_started(|| CommandStartedEvent {
            database_name: database.to_owned(),
            command_name: command.to_owned(),
            request_id,
            connection_id: connection_id.to_owned(),
        });
        InFlightCommand {
            request_id,
            pending: Some(Pending {
                dispatcher: self.dispatcher.clone(),
                command_name: command.to_owned(),
                connection_id: connection_id.to_owned(),
                // Taken after the started callbacks so their run time is not attributed to the
                // command itself.
                started_at: Instant::now(),
            }),
        }
    }

    /// Run command future, reporting its start and outcome.
    ///
    /// If the returned future is dropped before completion, the command is reported as failed.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `fut`, unchanged.
    pub async fn run<T, E, F>(
        &self,
        database: &str,
        command: &str,
        connection_id: &str,
        fut: F,
    ) -> Result<T, E>
    where
        E: fmt::Display,
        F: Future<Output = Result<T, E>>,
    {
        let cmd = self.start(database, command, connection_id);
        match fut.await {
            Ok(value) => {
                cmd.succeeded();
                Ok(value)
            }
            Err(err) => {
                cmd.failed(&err);
                Err(err)
            }
        }
    }
}

struct Pending {
    dispatcher: Dispatcher,
    command_name: String,
    connection_id: String,
    started_at: Instant,
}

/// Command that was reported as started and still awaits its outcome.
///
/// Consuming methods guarantee at most one terminal event. Dropping the guard without calling
/// either of them reports the command as failed with [`ABANDONED_FAILURE`].
#[must_use = "dropping an in-flight command reports it as failed"]
pub struct InFlightCommand {
    request_id: i64,
    /// Empty if there are no command monitors.
    pending: Option<Pending>,
}

impl fmt::Debug for InFlightCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightCommand")
            .field("request_id", &self.request_id)
            .field("monitored", &self.pending.is_some())
            .finish()
    }
}

impl InFlightCommand {
    /// Request identifier of this command.
    #[must_use]
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Report successful completion.
    pub fn succeeded(mut self) {
        if let Some(pending) = self.pending.take() {
            let dispatcher = pending.dispatcher.clone();
            dispatcher.command_succeeded(|| CommandSucceededEvent {
                finished: pending.into_finished(self.request_id),
            });
        }
    }

    /// Report failed completion.
    pub fn failed(mut self, failure: impl fmt::Display) {
        self.fail(failure);
    }

    fn fail(&mut self, failure: impl fmt::Display) {
        if let Some(pending) = self.pending.take() {
            let dispatcher = pending.dispatcher.clone();
            dispatcher.command_failed(|| CommandFailedEvent {
                finished: pending.into_finished(self.request_id),
                failure: failure.to_string(),
            });
        }
    }
}

impl Pending {
    fn into_finished(self, request_id: i64) -> CommandFinishedEvent {
        let elapsed = self.started_at.elapsed();
        CommandFinishedEvent {
            duration_nanos: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            command_name: self.command_name,
            request_id,
            connection_id: self.connection_id,
        }
    }
}

impl Drop for InFlightCommand {
    fn drop(&mut self) {
        self.fail(ABANDONED_FAILURE);
    }
}
