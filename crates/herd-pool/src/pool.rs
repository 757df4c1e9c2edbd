//! Bounded connection pool.
//!
//! Capacity is enforced by a fair semaphore with one permit per
//! connection. A caller holding a permit either reuses the oldest idle
//! connection or, when none is idle, opens a new one. At every instant the
//! number of checked-out plus idle connections stays within `max_size`.
//!
//! Connections are returned by [`PooledConnection::release`] or, as a
//! fallback, when the guard is dropped.

use crate::factory::ConnectionFactory;
use crate::metrics::{PoolMetrics, PoolStats};
use crate::settings::PoolSettings;
use futures::future::BoxFuture;
use futures::FutureExt;
use herd_core::{HerdError, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

struct IdleConnection<C> {
    conn: C,
    id: Uuid,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    active: HashSet<Uuid>,
    closed: bool,
}

struct PoolInner<F: ConnectionFactory> {
    name: String,
    settings: PoolSettings,
    factory: F,
    state: Mutex<PoolState<F::Connection>>,
    semaphore: Semaphore,
    metrics: PoolMetrics,
}

/// A bounded pool of reusable connections.
///
/// Cloning is cheap and yields a handle to the same pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Creates an empty pool. Call [`initialize`](Self::initialize) to open
    /// the first `min_size` connections.
    ///
    /// Settings are used as given. A `max_size` of zero yields a pool that
    /// can never hand out a connection; use [`try_new`](Self::try_new) to
    /// reject such settings up front.
    pub fn new(name: impl Into<String>, factory: F, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                semaphore: Semaphore::new(settings.max_size),
                settings,
                factory,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: HashSet::new(),
                    closed: false,
                }),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// Creates a pool after validating its settings.
    pub fn try_new(name: impl Into<String>, factory: F, settings: PoolSettings) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| HerdError::config(e.to_string()))?;
        Ok(Self::new(name, factory, settings))
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the pool settings.
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Returns the connection factory.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Opens connections until `min_size` are idle. Factory failures are
    /// logged and skipped, so the pool may start under-provisioned. Returns
    /// how many connections were opened.
    pub async fn initialize(&self) -> usize {
        let inner = &self.inner;
        let mut opened = 0;

        for _ in 0..inner.settings.min_size {
            // Each connection is opened under a permit so concurrent
            // acquires cannot push the pool past capacity.
            let Ok(permit) = inner.semaphore.try_acquire() else {
                break;
            };
            {
                let state = inner.state.lock();
                // Idle connections hold no permit, so they must fit in what
                // the other permit holders leave free.
                if state.idle.len() >= inner.settings.min_size
                    || state.idle.len() > inner.semaphore.available_permits()
                {
                    break;
                }
            }

            match inner.create().await {
                Ok((conn, id, created_at)) => {
                    let rejected = {
                        let mut state = inner.state.lock();
                        let full =
                            state.idle.len() + state.active.len() >= inner.settings.max_size;
                        if state.closed || full {
                            Some(conn)
                        } else {
                            state.idle.push_back(IdleConnection {
                                conn,
                                id,
                                created_at,
                                idle_since: Instant::now(),
                            });
                            None
                        }
                    };
                    drop(permit);
                    if let Some(conn) = rejected {
                        inner.destroy(conn).await;
                        break;
                    }
                    opened += 1;
                }
                Err(err) => {
                    warn!(pool = %inner.name, error = %err, "Failed to open connection during initialization");
                }
            }
        }

        info!(
            pool = %inner.name,
            opened,
            min_size = inner.settings.min_size,
            "Connection pool initialized"
        );
        opened
    }

    /// Checks out a connection, waiting up to `acquire_timeout` when the
    /// pool is at capacity.
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        let inner = &self.inner;
        if inner.state.lock().closed {
            return Err(inner.closed_error());
        }
        inner.metrics.record_request();

        let started = Instant::now();
        let wait = inner.settings.acquire_timeout;
        let permit = match tokio::time::timeout(wait, inner.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(inner.closed_error()),
            Err(_) => {
                inner.metrics.record_timeout();
                warn!(pool = %inner.name, waited_ms = wait.as_millis() as u64, "Connection acquire timed out");
                return Err(HerdError::timeout(
                    format!("connection from pool `{}`", inner.name),
                    wait,
                ));
            }
        };

        let (conn, id, created_at) = inner.checkout().await?;

        // The guard owns the slot from here and returns it on release.
        permit.forget();
        inner.metrics.record_acquire(started.elapsed());

        Ok(PooledConnection {
            conn: Some(conn),
            id,
            created_at,
            pool: Arc::clone(inner),
        })
    }

    /// Returns a connection to the pool. Equivalent to
    /// [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection<F>) {
        conn.release().await;
    }

    /// Runs `f` with a checked-out connection and always returns the
    /// connection afterwards, even if `f` fails or panics.
    ///
    /// ```rust
    /// use futures::FutureExt;
    /// use herd_pool::{ConnectionPool, FnFactory, PoolSettings};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> herd_core::Result<()> {
    /// let pool = ConnectionPool::new(
    ///     "counters",
    ///     FnFactory::new(|| async { Ok::<u64, anyhow::Error>(0) }),
    ///     PoolSettings::default(),
    /// );
    ///
    /// let value = pool
    ///     .with_connection(|conn| async move {
    ///         *conn += 1;
    ///         Ok(*conn)
    ///     }.boxed())
    ///     .await?;
    /// assert_eq!(value, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_connection<T, Fun>(&self, f: Fun) -> Result<T>
    where
        Fun: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, anyhow::Result<T>>,
    {
        let mut guard = self.acquire().await?;
        let outcome = AssertUnwindSafe(async { f(&mut *guard).await })
            .catch_unwind()
            .await;
        guard.release().await;

        match outcome {
            Ok(result) => result.map_err(HerdError::execution),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Closes every idle connection that has sat unused for `idle_timeout`
    /// or outlived `max_lifetime`. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let inner = &self.inner;
        let expired: Vec<F::Connection> = {
            let mut state = inner.state.lock();
            let now = Instant::now();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|idle| inner.is_stale(idle, now));
            state.idle = kept;
            expired.into_iter().map(|idle| idle.conn).collect()
        };

        let reaped = expired.len();
        for conn in expired {
            inner.destroy(conn).await;
        }
        if reaped > 0 {
            debug!(pool = %inner.name, reaped, "Reaped idle connections");
        }
        reaped
    }

    /// Closes the pool. Later acquires fail, waiting acquires are woken with
    /// an error, and idle connections are closed. Checked-out connections
    /// are closed when they are released. Closing twice is a no-op.
    pub async fn close(&self) {
        let inner = &self.inner;
        let idle = {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        inner.semaphore.close();

        let count = idle.len();
        for idle in idle {
            inner.destroy(idle.conn).await;
        }
        info!(pool = %inner.name, closed_idle = count, "Connection pool closed");
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Returns statistics.
    pub fn stats(&self) -> PoolStats {
        let (active, idle) = {
            let state = self.inner.state.lock();
            (state.active.len(), state.idle.len())
        };
        self.inner
            .metrics
            .snapshot(active, idle, self.inner.settings.max_size)
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn closed_error(&self) -> HerdError {
        HerdError::closed(format!("pool `{}`", self.name))
    }

    fn is_stale(&self, idle: &IdleConnection<F::Connection>, now: Instant) -> bool {
        now.saturating_duration_since(idle.idle_since) >= self.settings.idle_timeout
            || now.saturating_duration_since(idle.created_at) >= self.settings.max_lifetime
    }

    fn within_lifetime(&self, created_at: Instant) -> bool {
        created_at.elapsed() < self.settings.max_lifetime
    }

    async fn create(&self) -> Result<(F::Connection, Uuid, Instant)> {
        match self.factory.connect().await {
            Ok(conn) => {
                let id = Uuid::new_v4();
                self.metrics.record_created();
                debug!(pool = %self.name, %id, "Opened connection");
                Ok((conn, id, Instant::now()))
            }
            Err(err) => {
                self.metrics.record_error();
                warn!(pool = %self.name, error = %err, "Failed to open connection");
                Err(HerdError::execution(err))
            }
        }
    }

    async fn destroy(&self, conn: F::Connection) {
        self.factory.close(conn).await;
        self.metrics.record_closed(1);
    }

    /// Takes the oldest usable idle connection, or opens a new one. Runs
    /// while the caller holds a permit.
    async fn checkout(&self) -> Result<(F::Connection, Uuid, Instant)> {
        let (reused, stale) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }

            let now = Instant::now();
            let mut stale = Vec::new();
            let mut reused = None;
            while let Some(idle) = state.idle.pop_front() {
                if self.is_stale(&idle, now) {
                    stale.push(idle.conn);
                } else {
                    reused = Some((idle.conn, idle.id, idle.created_at));
                    break;
                }
            }
            (reused, stale)
        };

        for conn in stale {
            self.destroy(conn).await;
        }

        let (mut conn, mut id, mut created_at) = match reused {
            Some(reused) => reused,
            None => self.create().await?,
        };

        if self.settings.validate_on_acquire
            && !(self.within_lifetime(created_at) && self.factory.is_valid(&mut conn).await)
        {
            self.metrics.record_validation_failure();
            debug!(pool = %self.name, %id, "Discarding invalid connection on acquire");
            self.destroy(conn).await;
            (conn, id, created_at) = self.create().await?;
        }

        let closed = {
            let mut state = self.state.lock();
            if !state.closed {
                state.active.insert(id);
            }
            state.closed
        };
        if closed {
            self.destroy(conn).await;
            return Err(self.closed_error());
        }

        Ok((conn, id, created_at))
    }

    /// Returns a checked-out connection: back to the idle queue when it is
    /// still valid and there is idle room, closed otherwise.
    async fn check_in(&self, mut conn: F::Connection, id: Uuid, created_at: Instant) {
        let started = Instant::now();
        // Hands the permit back even if this future is dropped midway.
        let slot = Slot { pool: self, id };

        let closed = self.state.lock().closed;
        let valid =
            !closed && self.within_lifetime(created_at) && self.factory.is_valid(&mut conn).await;
        if !closed && !valid {
            self.metrics.record_validation_failure();
        }

        let rejected = {
            let mut state = self.state.lock();
            state.active.remove(&id);
            if valid && !state.closed && state.idle.len() < self.settings.max_idle {
                state.idle.push_back(IdleConnection {
                    conn,
                    id,
                    created_at,
                    idle_since: Instant::now(),
                });
                None
            } else {
                Some(conn)
            }
        };

        if let Some(conn) = rejected {
            debug!(pool = %self.name, %id, valid, "Closing released connection");
            self.destroy(conn).await;
        }
        drop(slot);
        self.metrics.record_release(started.elapsed());
    }

    /// Synchronous fallback for a guard dropped outside any runtime. The
    /// connection is dropped without the factory's close hook.
    fn discard(&self, conn: F::Connection, id: Uuid) {
        drop(Slot { pool: self, id });
        drop(conn);
        self.metrics.record_closed(1);
    }
}

/// A checked-out connection's claim on pool capacity.
struct Slot<'a, F: ConnectionFactory> {
    pool: &'a PoolInner<F>,
    id: Uuid,
}

impl<F: ConnectionFactory> Drop for Slot<'_, F> {
    fn drop(&mut self) {
        self.pool.state.lock().active.remove(&self.id);
        self.pool.semaphore.add_permits(1);
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the underlying connection. Prefer
/// [`release`](Self::release); dropping the guard also returns the
/// connection, on a spawned task.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    id: Uuid,
    created_at: Instant,
    pool: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Returns the connection's pool-assigned identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns when the connection was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns how long this connection has been alive.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns the connection to its pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.id, self.created_at).await;
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let pool = Arc::clone(&self.pool);
        let (id, created_at) = (self.id, self.created_at);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.check_in(conn, id, created_at).await;
                });
            }
            Err(_) => pool.discard(conn, id),
        }
    }
}

impl<F: ConnectionFactory> std::ops::Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection present until released")
    }
}

impl<F: ConnectionFactory> std::ops::DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection present until released")
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("id", &self.id)
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FnFactory;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter_factory(counter: &Arc<AtomicU32>) -> impl ConnectionFactory<Connection = u32> {
        let counter = Arc::clone(counter);
        FnFactory::new(move || {
            let next = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, anyhow::Error>(next) }
        })
    }

    fn settings(min_size: usize, max_size: usize) -> PoolSettings {
        PoolSettings {
            min_size,
            max_size,
            max_idle: max_size,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pool_acquire_release() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new("test", counter_factory(&counter), settings(0, 2));

        let conn1 = pool.acquire().await.unwrap();
        assert_eq!(*conn1, 0);
        let conn2 = pool.acquire().await.unwrap();
        assert_eq!(*conn2, 1);

        let stats = pool.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.idle, 0);

        conn1.release().await;
        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 1);

        // Reuses the released connection.
        let conn3 = pool.acquire().await.unwrap();
        assert_eq!(*conn3, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop((conn2, conn3));
    }

    #[tokio::test]
    async fn test_pool_timeout() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new("test", counter_factory(&counter), settings(1, 1));
        pool.initialize().await;

        let _conn = pool.acquire().await.unwrap();

        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_full_pool_serves_two_then_times_out() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new("test", counter_factory(&counter), settings(2, 2));
        assert_eq!(pool.initialize().await, 2);
        assert_eq!(pool.stats().idle, 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert!(pool.acquire().await.unwrap_err().is_timeout());

        // Capacity frees up for a waiter once a connection comes back.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|conn| *conn) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.release().await;
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(b);
    }

    #[tokio::test]
    async fn test_stale_connection_not_handed_out() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new(
            "test",
            counter_factory(&counter),
            PoolSettings {
                max_lifetime: Duration::from_millis(20),
                idle_timeout: Duration::from_secs(60),
                ..settings(1, 1)
            },
        );
        pool.initialize().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
        assert!(conn.age() < Duration::from_millis(20));
        assert_eq!(pool.stats().validation_failures, 0);
        // The aged idle connection is dropped before validation runs.
        assert_eq!(pool.stats().total_closed, 1);
    }

    #[tokio::test]
    async fn test_invalid_connection_replaced_on_acquire() {
        let counter = Arc::new(AtomicU32::new(0));
        let next = Arc::clone(&counter);

        let factory = FnFactory::new(move || {
            let id = next.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, anyhow::Error>(id) }
        })
        // The first connection opened is broken.
        .with_validator(|conn: &u32| *conn > 0);

        let pool = ConnectionPool::new("test", factory, settings(1, 1));
        pool.initialize().await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
        let stats = pool.stats();
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_closed, 1);
        conn.release().await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_release_sheds_excess_idle() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new(
            "test",
            counter_factory(&counter),
            PoolSettings {
                max_idle: 1,
                ..settings(0, 3)
            },
        );

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        a.release().await;
        b.release().await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total_closed, 1);
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces_and_frees_capacity() {
        let attempts = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&attempts);
        let factory = FnFactory::new(move || {
            let attempt = count.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("connection refused");
                }
                Ok(attempt)
            }
        });
        let pool = ConnectionPool::new("test", factory, settings(0, 1));

        let err = pool.acquire().await.unwrap_err();
        assert!(err.as_execution().is_some());
        assert!(err.to_string().contains("connection refused"));

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
        assert_eq!(pool.stats().errors, 1);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_initialize_skips_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&attempts);
        let factory = FnFactory::new(move || {
            let attempt = count.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt % 2 == 0 {
                    anyhow::bail!("flaky backend");
                }
                Ok(attempt)
            }
        });
        let pool = ConnectionPool::new("test", factory, settings(3, 3));

        assert_eq!(pool.initialize().await, 1);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire_and_destroys_on_release() {
        let closed = Arc::new(AtomicU32::new(0));
        let closes = Arc::clone(&closed);
        let factory = FnFactory::new(|| async { Ok::<_, anyhow::Error>(()) }).with_closer(move |_| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
        let pool = ConnectionPool::new("db", factory, settings(2, 3));
        pool.initialize().await;

        let held = pool.acquire().await.unwrap();
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "pool `db` is closed");

        held.release().await;
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle), (0, 0));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new(
            "test",
            counter_factory(&counter),
            PoolSettings {
                acquire_timeout: Duration::from_secs(30),
                ..settings(0, 1)
            },
        );
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close().await;

        assert!(waiter.await.unwrap().unwrap_err().is_closed());
        held.release().await;
    }

    #[tokio::test]
    async fn test_dropped_guard_returns_connection() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new("test", counter_factory(&counter), settings(0, 1));

        drop(pool.acquire().await.unwrap());
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 0);
        conn.release().await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_with_connection_releases_on_error_and_panic() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new("test", counter_factory(&counter), settings(0, 1));

        let err = pool
            .with_connection(|_conn| async { Err::<(), _>(anyhow::anyhow!("query failed")) }.boxed())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("query failed"));
        assert_eq!(pool.stats().idle, 1);

        let panicked = AssertUnwindSafe(pool.with_connection(|_conn| {
            async {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            }
            .boxed()
        }))
        .catch_unwind()
        .await;
        assert!(panicked.is_err());

        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle), (0, 1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new(
            "test",
            counter_factory(&counter),
            PoolSettings {
                idle_timeout: Duration::from_secs(5),
                ..settings(2, 2)
            },
        );
        pool.initialize().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(pool.reap_idle().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.reap_idle().await, 2);
        assert_eq!(pool.stats().total_closed, 2);
    }

    #[test]
    fn test_try_new_rejects_invalid_settings() {
        let counter = Arc::new(AtomicU32::new(0));
        let invalid = PoolSettings {
            max_size: 0,
            ..settings(0, 1)
        };
        assert!(matches!(
            ConnectionPool::try_new("test", counter_factory(&counter), invalid),
            Err(HerdError::Config(_))
        ));
        assert!(ConnectionPool::try_new("test", counter_factory(&counter), settings(1, 2)).is_ok());
    }

    #[tokio::test]
    async fn test_initialize_respects_checked_out_connections() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new("test", counter_factory(&counter), settings(2, 2));

        let held = pool.acquire().await.unwrap();
        pool.initialize().await;

        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert!(stats.active + stats.idle <= 2, "{stats:?}");

        let other = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle), (2, 0));
        assert!(pool.acquire().await.unwrap_err().is_timeout());

        held.release().await;
        other.release().await;
        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle), (0, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bound_invariant_under_contention() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new(
            "test",
            counter_factory(&counter),
            PoolSettings {
                max_idle: 2,
                acquire_timeout: Duration::from_secs(5),
                ..settings(1, 3)
            },
        );
        pool.initialize().await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let conn = pool.acquire().await.unwrap();
                    let stats = pool.stats();
                    assert!(stats.active + stats.idle <= 3, "{stats:?}");
                    tokio::task::yield_now().await;
                    conn.release().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert!(stats.total_created - stats.total_closed <= 3);
    }
}
