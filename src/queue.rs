//! Asynchronous offloading of monitor callbacks.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, trace_span, warn, Instrument};

use crate::{
    command::{
        CommandFailedEvent, CommandMonitor, CommandStartedEvent, CommandSucceededEvent,
        MonitorContext,
    },
    dispatch::{Delivery, Dispatcher},
    pool::{Event, PoolMonitor},
};

/// Error type used when starting a monitor queue.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Queue worker needs a Tokio runtime to run on.
    #[error("Monitor queue requires a Tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Configuration for monitor callback queue.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct QueueConfig {
    /// Maximum number of events waiting for delivery.
    ///
    /// Events reported while the queue is full are dropped.
    #[serde(default = "QueueConfig::default_capacity")]
    pub capacity: NonZeroUsize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

impl QueueConfig {
    /// Queue configuration with specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self { capacity }
    }

    /// Default value for [`Self::capacity`].
    #[must_use]
    #[inline]
    fn default_capacity() -> NonZeroUsize {
        NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Monitor moving callback execution off the producer's path.
///
/// Events are copied into a bounded queue and delivered to an inner [`Dispatcher`] by a single
/// worker task, in reporting order. Reporting never waits: if the queue is full, the event is
/// dropped and counted.
///
/// Each delivery runs on the blocking thread pool. If the inner dispatcher has a budget, the
/// worker waits for at most that long, then cancels the delivery context and proceeds to the
/// next event without waiting for the straggler.
#[derive(Clone, Debug)]
pub struct QueuedMonitor {
    tx: mpsc::Sender<Delivery>,
    dropped: Arc<AtomicU64>,
}

impl QueuedMonitor {
    /// Start queue worker delivering to `inner` on the current Tokio runtime.
    ///
    /// The worker stops once every clone of the returned monitor is dropped and the queue is
    /// drained.
    ///
    /// # Errors
    ///
    /// Returns `Err` if called outside of a Tokio runtime.
    pub fn spawn(
        inner: Dispatcher,
        config: &QueueConfig,
    ) -> Result<(Self, JoinHandle<()>), QueueError> {
        let handle = Handle::try_current()?;
        let (tx, rx) = mpsc::channel(config.capacity.get());
        let task = handle.spawn(worker(rx, inner).instrument(trace_span!("monitor_queue")));
        Ok((
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            task,
        ))
    }

    /// Number of events dropped because the queue was full or the worker was gone.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, item: Delivery) {
        let item = match self.tx.try_send(item) {
            Ok(()) => return,
            Err(TrySendError::Full(item) | TrySendError::Closed(item)) => item,
        };
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            event = item.kind(),
            dropped, "monitor queue unavailable, event dropped"
        );
    }
}

impl PoolMonitor for QueuedMonitor {
    fn event(&self, event: &Event) {
        self.enqueue(Delivery::Pool(event.clone()));
    }
}

impl CommandMonitor for QueuedMonitor {
    fn started(&self, _ctx: &MonitorContext, event: &CommandStartedEvent) {
        self.enqueue(Delivery::Started(event.clone()));
    }

    fn succeeded(&self, _ctx: &MonitorContext, event: &CommandSucceededEvent) {
        self.enqueue(Delivery::Succeeded(event.clone()));
    }

    fn failed(&self, _ctx: &MonitorContext, event: &CommandFailedEvent) {
        self.enqueue(Delivery::Failed(event.clone()));
    }
}

/// Queue worker loop.
async fn worker(mut rx: mpsc::Receiver<Delivery>, inner: Dispatcher) {
    let budget = inner.budget();
    while let Some(item) = rx.recv().await {
        let kind = item.kind();
        let ctx = MonitorContext::from_budget(budget);
        let task = {
            let ctx = ctx.clone();
            let inner = inner.clone();
            tokio::task::spawn_blocking(move || inner.deliver(&item, &ctx))
        };
        let res = match budget {
            Some(budget) => match timeout(budget, task).await {
                Ok(res) => res,
                Err(_) => {
                    ctx.cancel();
                    warn!(event = kind, ?budget, "queued monitor delivery timed out");
                    continue;
                }
            },
            None => task.await,
        };
        if let Err(err) = res {
            error!(event = kind, %err, "queued monitor delivery failed");
        }
    }
    debug!("monitor queue worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        command::CommandCallbacks,
        pool::{EventType, Reason},
    };

    fn capacity(n: usize) -> QueueConfig {
        QueueConfig::with_capacity(NonZeroUsize::new(n).unwrap())
    }

    #[test]
    fn spawn_outside_runtime_fails() {
        let res = QueuedMonitor::spawn(Dispatcher::none(), &QueueConfig::default());
        assert!(matches!(res, Err(QueueError::NoRuntime(_))));
    }

    #[test]
    fn default_capacity() {
        assert_eq!(QueueConfig::default().capacity.get(), 1024);
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let inner = Dispatcher::builder()
            .pool_monitor(move |e: &Event| sink.lock().push(e.event_type()))
            .build();
        let (queue, worker) = QueuedMonitor::spawn(inner, &capacity(16)).unwrap();
        let outer = Dispatcher::builder().pool_monitor(queue.clone()).build();
        outer.pool_event(|| Event::connection_created("h:1", 1));
        outer.pool_event(|| Event::checked_out("h:1", 1));
        outer.pool_event(|| Event::checked_in("h:1", 1));
        outer.pool_event(|| Event::connection_closed("h:1", 1, Reason::PoolClosed));
        assert_eq!(queue.dropped(), 0);
        drop(outer);
        drop(queue);
        worker.await.unwrap();
        assert_eq!(
            *seen.lock(),
            [
                EventType::ConnectionCreated,
                EventType::CheckedOut,
                EventType::CheckedIn,
                EventType::ConnectionClosed,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_drops_without_blocking() {
        let gate = Arc::new(std::sync::Barrier::new(2));
        let gate_cb = gate.clone();
        let inner = Dispatcher::builder()
            .pool_monitor(move |_: &Event| {
                gate_cb.wait();
            })
            .build();
        let (queue, worker) = QueuedMonitor::spawn(inner, &capacity(1)).unwrap();
        // First event occupies the worker, second fills the queue.
        queue.event(&Event::pool_closed("h:1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.event(&Event::pool_closed("h:1"));
        queue.event(&Event::pool_closed("h:1"));
        queue.event(&Event::pool_closed("h:1"));
        assert_eq!(queue.dropped(), 2);
        gate.wait();
        gate.wait();
        drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_callback_is_cancelled_after_budget() {
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let sink = cancelled.clone();
        let inner = Dispatcher::builder()
            .budget(Some(Duration::from_millis(20)))
            .command_monitor(CommandCallbacks::new().on_started(move |ctx, e| {
                if e.request_id == 1 {
                    while !ctx.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                sink.lock().push((e.request_id, ctx.is_cancelled()));
            }))
            .build();
        let (queue, worker) = QueuedMonitor::spawn(inner, &capacity(8)).unwrap();
        for request_id in [1, 2] {
            queue.started(
                &MonitorContext::new(),
                &CommandStartedEvent {
                    database_name: "db".into(),
                    command_name: "find".into(),
                    request_id,
                    connection_id: "c1".into(),
                },
            );
        }
        drop(queue);
        worker.await.unwrap();
        // Straggler may finish only after the worker stopped.
        for _ in 0..100 {
            if cancelled.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut seen = cancelled.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, [(1, true), (2, false)]);
    }
}
