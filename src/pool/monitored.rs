use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug_span, Instrument};

use crate::{
    error::Error,
    pool::{MonitorPoolOptions, PoolReporter, Reason},
};

/// Connection handed out by an observable pool.
pub trait PooledConnection {
    /// Identifier of the connection, unique within its pool.
    fn connection_id(&self) -> u64;
}

/// Pool objects implementing this trait can be monitored.
///
/// The pool reports its own connection creation, closing and clearing through a
/// [`PoolReporter`] shared with the [`MonitoredPool`]; checkouts, check-ins and pool closure are
/// reported by the wrapper.
#[async_trait::async_trait]
pub trait ObservablePool: Send + Sync {
    /// Connection type contained in the pool.
    ///
    /// Dropping a connection must return it to the pool.
    type Connection: PooledConnection + Send;

    /// Pool size limits.
    fn options(&self) -> MonitorPoolOptions;

    /// Acquire a connection from the pool.
    async fn get(&self) -> Result<Self::Connection, Error>;

    /// Instantly acquire a connection from the pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if blocking is required, or if this operation is not implemented for this
    /// pool type.
    fn try_get(&self) -> Result<Self::Connection, Error> {
        Err(Error::NotImplemented)
    }

    /// Try to acquire a connection from the pool, waiting for a bounded time.
    ///
    /// # Errors
    ///
    /// Must return [`Error::AcquireTimeout`] if waiting time was exhausted.
    ///
    /// Returns [`Error::NotImplemented`] if this operation is not implemented for this pool type.
    async fn get_timeout(&self, _timeout: Duration) -> Result<Self::Connection, Error> {
        Err(Error::NotImplemented)
    }

    /// Tear down all pool connections.
    ///
    /// Closures of idle connections must be reported before this returns. Connections returned
    /// to the pool after this call must be closed and reported as they come back.
    async fn close(&self) {}
}

/// Close progress shared by a monitored pool and its outstanding connections.
struct CloseState {
    reporter: PoolReporter,
    /// Acquisitions in progress plus connections checked out.
    outstanding: AtomicUsize,
    /// Set as soon as closing starts.
    closing: AtomicBool,
    /// Set once the original pool finished closing.
    drained: AtomicBool,
    /// Set once pool closure was reported.
    reported: AtomicBool,
}

impl CloseState {
    fn lease(self: &Arc<Self>) -> Lease {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Lease(Arc::clone(self))
    }

    /// Report pool closure once the original pool is closed and nothing is outstanding.
    fn report_if_idle(&self) {
        if self.drained.load(Ordering::SeqCst)
            && self.outstanding.load(Ordering::SeqCst) == 0
            && !self.reported.swap(true, Ordering::SeqCst)
        {
            self.reporter.pool_closed();
        }
    }
}

/// Acquisition in progress, or connection checked out.
struct Lease(Arc<CloseState>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.0.report_if_idle();
    }
}

/// Monitored pool.
///
/// Reports pool creation on construction, checkout outcome on every acquisition, check-in when
/// the returned connection guard is dropped, and pool closure.
pub struct MonitoredPool<P> {
    /// Event reporter and close progress.
    state: Arc<CloseState>,
    /// Original pool.
    pool: P,
}

impl<P: ObservablePool> MonitoredPool<P> {
    /// Monitor provided pool, reporting its creation.
    ///
    /// The pool must not have reported any events through `reporter` yet.
    pub fn new(reporter: PoolReporter, pool: P) -> Self {
        reporter.pool_created(pool.options());
        Self {
            state: Arc::new(CloseState {
                reporter,
                outstanding: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
                drained: AtomicBool::new(false),
                reported: AtomicBool::new(false),
            }),
            pool,
        }
    }

    /// Event reporter for this pool.
    #[must_use]
    pub fn reporter(&self) -> &PoolReporter {
        &self.state.reporter
    }

    /// Whether the pool was closed, or is being closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closing.load(Ordering::SeqCst)
    }

    /// Report acquisition outcome, and wrap acquired connection.
    fn finish_acquire(
        &self,
        res: Result<P::Connection, Error>,
        lease: Lease,
    ) -> Result<MonitoredConnection<P::Connection>, Error> {
        match res {
            Ok(conn) => {
                let connection_id = conn.connection_id();
                self.state.reporter.checked_out(connection_id);
                Ok(MonitoredConnection {
                    connection_id,
                    conn,
                    lease,
                })
            }
            Err(err) => {
                self.state.reporter.check_out_failed(err.reason());
                Err(err)
            }
        }
    }

    /// Register an acquisition, rejecting it if the pool is closed.
    fn begin_acquire(&self) -> Result<Lease, Error> {
        let lease = self.state.lease();
        if self.is_closed() {
            self.state.reporter.check_out_failed(Reason::PoolClosed);
            return Err(Error::PoolClosed);
        }
        Ok(lease)
    }

    /// Acquire monitored connection from the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] if the pool was closed, or the error returned by the
    /// original pool.
    pub async fn get(&self) -> Result<MonitoredConnection<P::Connection>, Error> {
        let lease = self.begin_acquire()?;
        let span = debug_span!("pool_acquire", address = self.reporter().address());
        let res = self.pool.get().instrument(span).await;
        self.finish_acquire(res, lease)
    }

    /// Instantly acquire a monitored connection from the pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pool was closed, if blocking is required, or if this operation is not
    /// implemented for this pool type.
    pub fn try_get(&self) -> Result<MonitoredConnection<P::Connection>, Error> {
        let lease = self.begin_acquire()?;
        let span =
            debug_span!("pool_try_acquire", address = self.reporter().address()).entered();
        let res = self.pool.try_get();
        drop(span);
        self.finish_acquire(res, lease)
    }

    /// Try to acquire a monitored connection from the pool, waiting for a bounded time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AcquireTimeout`] if waiting time was exhausted, [`Error::PoolClosed`] if
    /// the pool was closed, or [`Error::NotImplemented`] if this operation is not implemented for
    /// this pool type.
    pub async fn get_timeout(
        &self,
        timeout: Duration,
    ) -> Result<MonitoredConnection<P::Connection>, Error> {
        let lease = self.begin_acquire()?;
        let span = debug_span!("pool_timed_acquire", address = self.reporter().address());
        let res = self.pool.get_timeout(timeout).instrument(span).await;
        self.finish_acquire(res, lease)
    }

    /// Close the pool.
    ///
    /// New acquisitions fail immediately, and the original pool is closed. Pool closure is
    /// reported once every connection checked out before closing is returned, and every
    /// acquisition already in progress has finished. If none are outstanding, this happens
    /// before `close` returns. Only the first call has any effect.
    pub async fn close(&self) {
        if self.state.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let span = debug_span!("pool_close", address = self.reporter().address());
        self.pool.close().instrument(span).await;
        self.state.drained.store(true, Ordering::SeqCst);
        self.state.report_if_idle();
    }
}

impl<P> Deref for MonitoredPool<P> {
    type Target = P;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl<P> AsRef<P> for MonitoredPool<P> {
    fn as_ref(&self) -> &P {
        &self.pool
    }
}

impl<P> fmt::Debug for MonitoredPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredPool")
            .field("address", &self.state.reporter.address())
            .field("closed", &self.state.closing.load(Ordering::Relaxed))
            .field("outstanding", &self.state.outstanding.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Monitored connection.
///
/// Check-in is reported when this guard is dropped, before the original connection is returned
/// to its pool.
pub struct MonitoredConnection<C> {
    /// Identifier captured at checkout.
    connection_id: u64,
    /// Original connection.
    conn: C,
    /// Must be declared after `conn`: pool closure may only be reported once the original
    /// connection is back in its pool.
    lease: Lease,
}

impl<C> MonitoredConnection<C> {
    /// Identifier of the connection.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

impl<C> Deref for MonitoredConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<C> DerefMut for MonitoredConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl<C> AsRef<C> for MonitoredConnection<C> {
    fn as_ref(&self) -> &C {
        &self.conn
    }
}

impl<C> AsMut<C> for MonitoredConnection<C> {
    fn as_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> fmt::Debug for MonitoredConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoredConnection")
            .field("address", &self.lease.0.reporter.address())
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl<C> Drop for MonitoredConnection<C> {
    fn drop(&mut self) {
        self.lease.0.reporter.checked_in(self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        dispatch::Dispatcher,
        pool::{Event, EventType},
    };

    struct DummyConnection(u64);

    impl PooledConnection for DummyConnection {
        fn connection_id(&self) -> u64 {
            self.0
        }
    }

    /// Dummy pool creating a new connection on every acquisition.
    struct DummyPool {
        reporter: PoolReporter,
        next_id: AtomicU64,
        fail_with: Mutex<Option<Error>>,
        gets: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ObservablePool for DummyPool {
        type Connection = DummyConnection;

        fn options(&self) -> MonitorPoolOptions {
            MonitorPoolOptions::new(10, 2)
        }

        async fn get(&self) -> Result<Self::Connection, Error> {
            self.gets.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = self.fail_with.lock().take() {
                return Err(err);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.reporter.connection_created(id);
            Ok(DummyConnection(id))
        }
    }

    fn setup() -> (MonitoredPool<DummyPool>, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = Dispatcher::builder()
            .pool_monitor(move |e: &Event| sink.lock().push(e.clone()))
            .build();
        let reporter = PoolReporter::new("h:1", dispatcher);
        let pool = DummyPool {
            reporter: reporter.clone(),
            next_id: AtomicU64::new(0),
            fail_with: Mutex::new(None),
            gets: AtomicUsize::new(0),
        };
        (MonitoredPool::new(reporter, pool), seen)
    }

    fn types(seen: &Mutex<Vec<Event>>) -> Vec<EventType> {
        seen.lock().iter().map(Event::event_type).collect()
    }

    #[tokio::test]
    async fn checkout_and_checkin() {
        let (pool, seen) = setup();
        let conn = pool.get().await.unwrap();
        assert_eq!(conn.connection_id(), 1);
        assert_eq!(conn.0, 1);
        drop(conn);
        assert_eq!(
            types(&seen),
            [
                EventType::PoolCreated,
                EventType::ConnectionCreated,
                EventType::CheckedOut,
                EventType::CheckedIn,
            ]
        );
        assert_eq!(seen.lock()[3], Event::checked_in("h:1", 1));
    }

    #[tokio::test]
    async fn failed_checkout_reports_reason() {
        let (pool, seen) = setup();
        *pool.fail_with.lock() = Some(Error::AcquireTimeout);
        assert!(matches!(pool.get().await, Err(Error::AcquireTimeout)));
        assert_eq!(
            seen.lock().last(),
            Some(&Event::check_out_failed("h:1", Reason::Timeout))
        );
    }

    #[tokio::test]
    async fn unsupported_operations_report_failure() {
        let (pool, seen) = setup();
        assert!(matches!(pool.try_get(), Err(Error::NotImplemented)));
        assert!(matches!(
            pool.get_timeout(Duration::from_millis(1)).await,
            Err(Error::NotImplemented)
        ));
        assert_eq!(
            types(&seen),
            [
                EventType::PoolCreated,
                EventType::CheckOutFailed,
                EventType::CheckOutFailed,
            ]
        );
    }

    #[tokio::test]
    async fn checkout_on_closed_pool() {
        let (pool, seen) = setup();
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.get().await, Err(Error::PoolClosed)));
        assert_eq!(pool.gets.load(Ordering::Relaxed), 0);
        assert_eq!(
            types(&seen),
            [
                EventType::PoolCreated,
                EventType::PoolClosed,
                EventType::CheckOutFailed,
            ]
        );
        assert_eq!(seen.lock()[2].reason(), Some(Reason::PoolClosed));
    }

    #[tokio::test]
    async fn closure_waits_for_checked_out_connection() {
        let (pool, seen) = setup();
        let conn = pool.get().await.unwrap();
        pool.close().await;
        assert!(pool.is_closed());
        assert!(!pool.reporter().is_closed());
        assert!(matches!(pool.try_get(), Err(Error::PoolClosed)));
        assert!(format!("{pool:?}").contains("outstanding: 1"));
        drop(conn);
        assert!(pool.reporter().is_closed());
        assert_eq!(
            types(&seen),
            [
                EventType::PoolCreated,
                EventType::ConnectionCreated,
                EventType::CheckedOut,
                EventType::CheckOutFailed,
                EventType::CheckedIn,
                EventType::PoolClosed,
            ]
        );
    }

    #[tokio::test]
    async fn failed_acquisition_releases_close() {
        let (pool, seen) = setup();
        *pool.fail_with.lock() = Some(Error::pool("refused"));
        assert!(matches!(pool.get().await, Err(Error::Pool(_))));
        pool.close().await;
        assert_eq!(
            types(&seen),
            [
                EventType::PoolCreated,
                EventType::CheckOutFailed,
                EventType::PoolClosed,
            ]
        );
        assert_eq!(seen.lock()[1].reason(), Some(Reason::ConnectionError));
    }
}
