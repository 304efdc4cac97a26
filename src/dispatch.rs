//! Delivery of events to registered monitors.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{error, warn};

use crate::{
    command::{CommandFailedEvent, CommandMonitor, CommandStartedEvent, CommandSucceededEvent},
    context::MonitorContext,
    pool::{Event, PoolMonitor},
    util::panic_message,
};

/// Owned event, as carried through an offloading queue.
#[derive(Clone, Debug)]
pub(crate) enum Delivery {
    Pool(Event),
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl Delivery {
    /// Short name used in diagnostics.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Pool(event) => event.event_type().as_str(),
            Self::Started(_) => "CommandStarted",
            Self::Succeeded(_) => "CommandSucceeded",
            Self::Failed(_) => "CommandFailed",
        }
    }
}

struct Inner {
    pool: Vec<Arc<dyn PoolMonitor>>,
    command: Vec<Arc<dyn CommandMonitor>>,
    budget: Option<Duration>,
}

/// Registered pool and command monitors.
///
/// Cheap to clone. Producers hand event-building closures to the dispatcher; these are only
/// called if at least one monitor for the corresponding channel is registered.
///
/// Monitors are called synchronously, in registration order. A panicking monitor is logged and
/// skipped, and never affects the producer.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool_monitors", &self.inner.pool.len())
            .field("command_monitors", &self.inner.command.len())
            .field("budget", &self.inner.budget)
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher without any monitors.
    ///
    /// All event reporting through it is a no-op.
    #[must_use]
    pub fn none() -> Self {
        DispatcherBuilder::new().build()
    }

    /// Create builder for dispatcher.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Whether any pool monitor is registered.
    #[must_use]
    #[inline]
    pub fn has_pool_monitor(&self) -> bool {
        !self.inner.pool.is_empty()
    }

    /// Whether any command monitor is registered.
    #[must_use]
    #[inline]
    pub fn has_command_monitor(&self) -> bool {
        !self.inner.command.is_empty()
    }

    /// Time budget for a single callback.
    #[must_use]
    pub fn budget(&self) -> Option<Duration> {
        self.inner.budget
    }

    /// Report pool event.
    pub fn pool_event(&self, make: impl FnOnce() -> Event) {
        if !self.has_pool_monitor() {
            return;
        }
        self.deliver_pool(&make());
    }

    /// Report command start.
    pub fn command_started(&self, make: impl FnOnce() -> CommandStartedEvent) {
        if !self.has_command_monitor() {
            return;
        }
        let ctx = MonitorContext::from_budget(self.inner.budget);
        self.deliver_started(&ctx, &make());
    }

    /// Report successful command completion.
    pub fn command_succeeded(&self, make: impl FnOnce() -> CommandSucceededEvent) {
        if !self.has_command_monitor() {
            return;
        }
        let ctx = MonitorContext::from_budget(self.inner.budget);
        self.deliver_succeeded(&ctx, &make());
    }

    /// Report failed command completion.
    pub fn command_failed(&self, make: impl FnOnce() -> CommandFailedEvent) {
        if !self.has_command_monitor() {
            return;
        }
        let ctx = MonitorContext::from_budget(self.inner.budget);
        self.deliver_failed(&ctx, &make());
    }

    /// Deliver an owned event with an externally managed context.
    pub(crate) fn deliver(&self, item: &Delivery, ctx: &MonitorContext) {
        match item {
            Delivery::Pool(event) => self.deliver_pool(event),
            Delivery::Started(event) => self.deliver_started(ctx, event),
            Delivery::Succeeded(event) => self.deliver_succeeded(ctx, event),
            Delivery::Failed(event) => self.deliver_failed(ctx, event),
        }
    }

    fn deliver_pool(&self, event: &Event) {
        let kind = event.event_type().as_str();
        for monitor in &self.inner.pool {
            self.guarded(kind, || monitor.event(event));
        }
    }

    fn deliver_started(&self, ctx: &MonitorContext, event: &CommandStartedEvent) {
        for monitor in &self.inner.command {
            self.guarded("CommandStarted", || monitor.started(ctx, event));
        }
    }

    fn deliver_succeeded(&self, ctx: &MonitorContext, event: &CommandSucceededEvent) {
        for monitor in &self.inner.command {
            self.guarded("CommandSucceeded", || monitor.succeeded(ctx, event));
        }
    }

    fn deliver_failed(&self, ctx: &MonitorContext, event: &CommandFailedEvent) {
        for monitor in &self.inner.command {
            self.guarded("CommandFailed", || monitor.failed(ctx, event));
        }
    }

    /// Run a single callback, containing panics and reporting budget overruns.
    fn guarded(&self, kind: &'static str, f: impl FnOnce()) {
        let started = Instant::now();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!(
                event = kind,
                panic = panic_message(payload.as_ref()),
                "monitor callback panicked"
            );
        }
        if let Some(budget) = self.inner.budget {
            let elapsed = started.elapsed();
            if elapsed > budget {
                warn!(event = kind, ?elapsed, ?budget, "monitor callback exceeded its budget");
            }
        }
    }
}

/// Builder for [`Dispatcher`].
#[derive(Default)]
#[must_use]
pub struct DispatcherBuilder {
    pool: Vec<Arc<dyn PoolMonitor>>,
    command: Vec<Arc<dyn CommandMonitor>>,
    budget: Option<Duration>,
}

impl DispatcherBuilder {
    /// Alternative method to construct a dispatcher builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register pool monitor.
    pub fn pool_monitor(self, monitor: impl PoolMonitor + 'static) -> Self {
        self.shared_pool_monitor(Arc::new(monitor))
    }

    /// Register shared pool monitor.
    pub fn shared_pool_monitor(mut self, monitor: Arc<dyn PoolMonitor>) -> Self {
        self.pool.push(monitor);
        self
    }

    /// Register command monitor.
    pub fn command_monitor(self, monitor: impl CommandMonitor + 'static) -> Self {
        self.shared_command_monitor(Arc::new(monitor))
    }

    /// Register shared command monitor.
    pub fn shared_command_monitor(mut self, monitor: Arc<dyn CommandMonitor>) -> Self {
        self.command.push(monitor);
        self
    }

    /// Set time budget for a single callback.
    ///
    /// Command callbacks receive a [`MonitorContext`] expiring after this budget. Overruns are
    /// logged.
    pub fn budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Whether any pool monitor is registered.
    #[must_use]
    pub fn has_pool_monitor(&self) -> bool {
        !self.pool.is_empty()
    }

    /// Whether any command monitor is registered.
    #[must_use]
    pub fn has_command_monitor(&self) -> bool {
        !self.command.is_empty()
    }

    /// Build dispatcher.
    #[must_use]
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                pool: self.pool,
                command: self.command,
                budget: self.budget,
            }),
        }
    }
}
