//! The connection pool
//!
//! `ConnectionPool` owns a registry of connections produced by a
//! [`ConnectionManager`] and hands them out to concurrent callers:
//! - lazy creation up to `max_size` (plus overflow), guarded by a circuit breaker
//! - waiting with an outer timeout when the pool is exhausted
//! - reset-on-release according to the configured strategy
//! - background maintenance, health checking and stats sampling

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::error::{PoolError, TimeoutKind};
use super::guard::PooledConnection;
use super::manager::ConnectionManager;
use super::metrics::{ConnectionStats, DetailedMetrics, MetricsRegistry, MetricsSnapshot, PoolMetrics};
use super::registry::{ConnectionId, Registry};
use super::scaler::{DynamicScaler, ScalerConfig};
use super::{health, maintenance};
use crate::config::PoolConfig;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Upper bound for the delay between creation retries
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Lifecycle state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    NotStarted,
    Running,
    Closed,
}

/// Shared pool state, owned by the pool handle and borrowed weakly by the
/// background loops
pub(super) struct PoolInner<M: ConnectionManager> {
    pub(super) name: String,
    pub(super) manager: M,
    pub(super) config: PoolConfig,
    registry: Mutex<Registry<M::Connection>>,
    /// Scaling lock; also owns the load samples
    pub(super) scaler: tokio::sync::Mutex<DynamicScaler>,
    pub(super) available: Notify,
    pub(super) breaker: CircuitBreaker,
    pub(super) metrics: Arc<PoolMetrics>,
    metrics_registry: Option<Arc<MetricsRegistry>>,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Outcome of one look at the registry on the acquisition path
enum Checkout<'a, M: ConnectionManager> {
    Ready(ConnectionId, Arc<M::Connection>),
    Reserved(Reservation<'a, M>),
    Exhausted,
}

/// A slot held for a creation in flight; released on drop unless fulfilled
struct Reservation<'a, M: ConnectionManager> {
    pool: &'a PoolInner<M>,
    active: bool,
}

impl<M: ConnectionManager> Reservation<'_, M> {
    /// Move a freshly created connection into the reserved slot
    ///
    /// Hands the connection back if the pool closed in the meantime.
    fn fulfil(
        mut self,
        conn: M::Connection,
        in_use: bool,
    ) -> Result<(ConnectionId, Arc<M::Connection>), M::Connection> {
        self.active = false;
        let pool = self.pool;
        let mut registry = pool.registry();
        if pool.is_closed() {
            registry.cancel_reservation();
            return Err(conn);
        }

        let (id, conn) = registry.insert_reserved(conn, in_use);
        pool.metrics.record_created(id);
        pool.update_gauges(&registry);
        drop(registry);

        if pool.config.log_connections {
            debug!(pool = %pool.name, connection_id = %id, in_use, "Created connection");
        }
        if !in_use {
            pool.available.notify_one();
        }
        Ok((id, conn))
    }
}

impl<M: ConnectionManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.active {
            self.pool.registry().cancel_reservation();
            // The freed slot may let a waiter create its own connection
            self.pool.available.notify_one();
        }
    }
}

/// Counts a caller as pending for as long as it waits, even if the
/// acquisition future is dropped mid-wait
struct Waiting<'a> {
    metrics: &'a PoolMetrics,
}

impl<'a> Waiting<'a> {
    fn start(metrics: &'a PoolMetrics) -> Self {
        metrics.waiter_started();
        Self { metrics }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.metrics.waiter_finished();
    }
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

impl<M: ConnectionManager> PoolInner<M> {
    pub(super) fn registry(&self) -> MutexGuard<'_, Registry<M::Connection>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn update_gauges(&self, registry: &Registry<M::Connection>) {
        self.metrics
            .update_gauges(registry.len(), registry.active_count());
    }

    pub(super) fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    fn state(&self) -> PoolState {
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => PoolState::NotStarted,
            RUNNING => PoolState::Running,
            _ => PoolState::Closed,
        }
    }

    fn reserve(&self, limit: usize) -> Option<Reservation<'_, M>> {
        if !self.registry().try_reserve(limit) {
            return None;
        }
        Some(Reservation {
            pool: self,
            active: true,
        })
    }

    fn checkout_or_reserve(&self) -> Checkout<'_, M> {
        let mut registry = self.registry();
        if let Some((id, conn)) = registry.checkout() {
            self.update_gauges(&registry);
            return Checkout::Ready(id, conn);
        }
        if registry.try_reserve(self.config.max_total()) {
            return Checkout::Reserved(Reservation {
                pool: self,
                active: true,
            });
        }
        Checkout::Exhausted
    }

    /// One creation attempt through the circuit breaker
    pub(super) async fn open_connection(&self) -> Result<M::Connection, PoolError> {
        self.breaker.check_request().await?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.connection_timeout, self.manager.create()).await;
        let error = match outcome {
            Ok(Ok(conn)) => {
                self.breaker.record_success().await;
                return Ok(conn);
            }
            Ok(Err(e)) => PoolError::ConnectionCreation(e.to_string()),
            Err(_) => PoolError::timeout(TimeoutKind::Create, started.elapsed()),
        };

        self.breaker.record_failure().await;
        self.metrics.record_creation_error();
        warn!(pool = %self.name, error = %error, "Connection creation failed");
        Err(error)
    }

    /// Creation with bounded retries; an open circuit is never retried
    async fn open_with_retry(&self) -> Result<M::Connection, PoolError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.open_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retryable() && attempt < attempts && !self.is_closed() => {
                    let delay = retry_delay(self.config.retry_backoff, attempt);
                    debug!(
                        pool = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying connection creation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close a connection that is not (or no longer) in the registry
    pub(super) async fn discard(&self, conn: &M::Connection) {
        match tokio::time::timeout(self.config.close_timeout, self.manager.close(conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(pool = %self.name, error = %e, "Failed to close untracked connection"),
            Err(_) => warn!(pool = %self.name, "Timed out closing untracked connection"),
        }
    }

    /// Close a connection already removed from the registry
    pub(super) async fn close_connection(&self, id: ConnectionId, conn: Arc<M::Connection>, reason: &str) {
        match tokio::time::timeout(self.config.close_timeout, self.manager.close(&conn)).await {
            Ok(Ok(())) => {
                if self.config.log_connections {
                    debug!(pool = %self.name, connection_id = %id, reason, "Closed connection");
                }
            }
            Ok(Err(e)) => {
                warn!(pool = %self.name, connection_id = %id, reason, error = %e, "Failed to close connection");
            }
            Err(_) => {
                warn!(pool = %self.name, connection_id = %id, reason, "Timed out closing connection");
            }
        }
        self.metrics.record_closed(id);
    }

    /// Create one idle connection if `limit` leaves room for it
    pub(super) async fn create_idle(&self, limit: usize) -> Result<Option<ConnectionId>, PoolError> {
        let Some(reservation) = self.reserve(limit) else {
            return Ok(None);
        };
        let conn = self.open_connection().await?;
        match reservation.fulfil(conn, false) {
            Ok((id, _)) => Ok(Some(id)),
            Err(conn) => {
                self.discard(&conn).await;
                Err(PoolError::PoolClosed)
            }
        }
    }

    /// Create up to `count` idle connections concurrently, bounded by
    /// `max_concurrent_creations`; returns how many were added
    pub(super) async fn create_idle_batch(self: &Arc<Self>, count: usize, limit: usize) -> usize {
        if count == 0 {
            return 0;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_creations));
        let mut tasks = JoinSet::new();
        for _ in 0..count {
            let pool = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| PoolError::PoolClosed)?;
                pool.create_idle(limit).await
            });
        }

        let mut created = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(_))) => created += 1,
                Ok(Ok(None)) => {}
                Ok(Err(PoolError::PoolClosed)) => {}
                Ok(Err(e)) => debug!(pool = %self.name, error = %e, "Background creation failed"),
                Err(e) => warn!(pool = %self.name, error = %e, "Creation task panicked"),
            }
        }
        created
    }

    async fn acquire(&self) -> Result<(ConnectionId, Arc<M::Connection>), PoolError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        let mut waiting: Option<Waiting<'_>> = None;

        let result = loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register interest before looking, so a release in between is not lost
            notified.as_mut().enable();

            if self.is_closed() {
                break Err(PoolError::PoolClosed);
            }

            match self.checkout_or_reserve() {
                Checkout::Ready(id, conn) => break Ok((id, conn)),
                Checkout::Reserved(reservation) => {
                    let conn = match self.open_with_retry().await {
                        Ok(conn) => conn,
                        Err(e) => break Err(e),
                    };
                    match reservation.fulfil(conn, true) {
                        Ok(pair) => break Ok(pair),
                        Err(conn) => {
                            self.discard(&conn).await;
                            break Err(PoolError::PoolClosed);
                        }
                    }
                }
                Checkout::Exhausted => {}
            }

            if waiting.is_none() {
                waiting = Some(Waiting::start(&self.metrics));
                debug!(pool = %self.name, "Pool exhausted, waiting for a connection");
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.metrics.record_acquire_timeout();
                break Err(PoolError::timeout(TimeoutKind::Acquire, started.elapsed()));
            }
        };

        drop(waiting);

        match &result {
            Ok((id, _)) => {
                self.metrics.record_acquired(*id, started.elapsed());
                if self.config.log_connections {
                    debug!(pool = %self.name, connection_id = %id, "Acquired connection");
                }
            }
            Err(e) => debug!(pool = %self.name, error = %e, "Acquisition failed"),
        }
        result
    }

    pub(super) async fn release(self: &Arc<Self>, id: ConnectionId) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let needs_reset = self.manager.supports_reset()
            && self.config.strategy.requires_reset(
                self.metrics.queries_since_reset(id),
                self.config.reset_after_queries,
            );

        enum Disposition<C> {
            Returned,
            AlreadyIdle,
            Reset(Arc<C>),
            Overflow(Arc<C>),
        }

        let disposition = {
            let mut registry = self.registry();
            let (in_use, conn) = match registry.get(id) {
                Some(record) => (record.in_use, Arc::clone(record.connection())),
                None => return Err(PoolError::NotFound(id)),
            };
            let disposition = if !in_use {
                Disposition::AlreadyIdle
            } else if registry.len() > self.config.max_size {
                registry.remove(id);
                Disposition::Overflow(conn)
            } else if needs_reset {
                Disposition::Reset(conn)
            } else {
                registry.check_in(id);
                Disposition::Returned
            };
            self.update_gauges(&registry);
            disposition
        };

        match disposition {
            Disposition::AlreadyIdle => {
                debug!(pool = %self.name, connection_id = %id, "Connection already released");
                return Ok(());
            }
            Disposition::Returned => {
                self.available.notify_one();
                if self.config.log_connections {
                    debug!(pool = %self.name, connection_id = %id, "Released connection");
                }
            }
            Disposition::Overflow(conn) => {
                self.close_connection(id, conn, "overflow").await;
                self.available.notify_one();
            }
            Disposition::Reset(conn) => {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.reset_and_return(id, conn).await });
            }
        }

        self.metrics.record_released();
        Ok(())
    }

    /// Reset a released connection, then return it or discard it on failure
    async fn reset_and_return(&self, id: ConnectionId, conn: Arc<M::Connection>) {
        let outcome = tokio::time::timeout(self.config.validation_timeout, self.manager.reset(&conn)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(PoolError::ResetFailure {
                id,
                reason: e.to_string(),
            }),
            Err(_) => Some(PoolError::timeout(TimeoutKind::Reset, self.config.validation_timeout)),
        };

        match failure {
            None => {
                self.metrics.record_reset(id, true);
                let returned = {
                    let mut registry = self.registry();
                    let returned = registry.check_in(id);
                    self.update_gauges(&registry);
                    returned
                };
                if returned {
                    self.available.notify_one();
                }
            }
            Some(error) => {
                self.metrics.record_reset(id, false);
                warn!(pool = %self.name, connection_id = %id, error = %error, "Discarding connection after failed reset");
                let removed = {
                    let mut registry = self.registry();
                    let removed = registry.remove(id);
                    self.update_gauges(&registry);
                    removed
                };
                if let Some(conn) = removed {
                    self.close_connection(id, conn, "reset failure").await;
                    self.available.notify_one();
                }
            }
        }
    }

    /// Remove every tracked connection and close it, best effort
    async fn drain_and_close(&self, reason: &str) -> usize {
        let drained = {
            let mut registry = self.registry();
            let drained = registry.drain();
            self.update_gauges(&registry);
            drained
        };
        let count = drained.len();
        for (id, conn) in drained {
            self.close_connection(id, conn, reason).await;
        }
        count
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        tasks.push(tokio::spawn(maintenance::run_maintenance(
            Arc::downgrade(self),
            self.shutdown.subscribe(),
        )));
        // Health checks only drive failover; check_health() stays available without it
        if self.config.failover_enabled {
            tasks.push(tokio::spawn(health::run_health_checks(
                Arc::downgrade(self),
                self.shutdown.subscribe(),
            )));
        }
        if self.config.stats_enabled {
            tasks.push(tokio::spawn(maintenance::run_stats(
                Arc::downgrade(self),
                self.shutdown.subscribe(),
            )));
        }
    }
}

/// Sleep for `period` unless the pool shuts down first
///
/// Returns false once the loop should stop.
pub(super) async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Connection pool handle
///
/// Cheap to clone; all clones share the same pool. Call [`close`](Self::close)
/// to shut the background loops down and close the remaining connections.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create a pool; no connection is opened until [`start`](Self::start)
    pub fn new(name: impl Into<String>, manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        Self::build(name.into(), manager, config, None)
    }

    /// Create a pool that publishes its metrics into a shared registry
    pub fn with_registry(
        name: impl Into<String>,
        manager: M,
        config: PoolConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, PoolError> {
        Self::build(name.into(), manager, config, Some(registry))
    }

    fn build(
        name: String,
        manager: M,
        config: PoolConfig,
        metrics_registry: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let metrics = Arc::new(PoolMetrics::new(config.max_size));
        if let Some(registry) = &metrics_registry {
            registry.register(&name, Arc::clone(&metrics));
        }
        let (shutdown, _) = watch::channel(false);

        let inner = PoolInner {
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from(&config)),
            scaler: tokio::sync::Mutex::new(DynamicScaler::new(ScalerConfig::from(&config))),
            registry: Mutex::new(Registry::new()),
            available: Notify::new(),
            metrics,
            metrics_registry,
            state: AtomicU8::new(NOT_STARTED),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            name,
            manager,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Seed `initial_size` connections and launch the background loops
    ///
    /// Calling it on a running pool is a no-op; a closed pool cannot be
    /// restarted. Seeding failures are logged, not returned.
    pub async fn start(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        match inner
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(CLOSED) => return Err(PoolError::PoolClosed),
            Err(_) => return Ok(()),
        }

        let initial = inner.config.initial_size.min(inner.config.max_size);
        info!(
            pool = %inner.name,
            initial_size = initial,
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            strategy = inner.config.strategy.name(),
            "Starting connection pool"
        );

        let seeded = inner.create_idle_batch(initial, inner.config.max_size).await;
        if seeded < initial {
            warn!(pool = %inner.name, seeded, requested = initial, "Pool seeded with fewer connections than requested");
        }

        if !inner.is_closed() {
            inner.spawn_background();
        }
        Ok(())
    }

    /// Take a connection out of the pool
    ///
    /// Prefers an idle connection, creates one while below the size limit,
    /// and otherwise waits until one is released or `acquire_timeout` passes.
    /// Starts the pool on first use.
    pub async fn acquire(&self) -> Result<(ConnectionId, Arc<M::Connection>), PoolError> {
        if self.inner.state() == PoolState::NotStarted {
            self.start().await?;
        }
        self.inner.acquire().await
    }

    /// Return a connection to the pool
    pub async fn release(&self, id: ConnectionId) -> Result<(), PoolError> {
        self.inner.release(id).await
    }

    /// Acquire a connection wrapped in a guard that releases it when dropped
    pub async fn get(&self) -> Result<PooledConnection<M>, PoolError> {
        let (id, conn) = self.acquire().await?;
        Ok(PooledConnection::new(self.clone(), id, conn))
    }

    /// Run `f` with a pooled connection, releasing it afterwards
    pub async fn with_connection<F, Fut, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<M::Connection>) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.get().await?;
        let output = f(guard.handle()).await;
        let id = guard.id();
        if let Err(e) = guard.release().await {
            debug!(pool = %self.inner.name, connection_id = %id, error = %e, "Release after scoped use failed");
        }
        Ok(output)
    }

    /// Account a query executed on a connection
    pub fn record_query(&self, id: ConnectionId, elapsed: Duration) -> Result<(), PoolError> {
        if self.inner.metrics.record_query(id, elapsed) {
            Ok(())
        } else {
            Err(PoolError::NotFound(id))
        }
    }

    /// Account a rolled-back transaction on a connection
    pub fn record_rollback(&self, id: ConnectionId) -> Result<(), PoolError> {
        if !self.inner.registry().contains(id) {
            return Err(PoolError::NotFound(id));
        }
        self.inner.metrics.record_rollback();
        Ok(())
    }

    /// Close every tracked connection and seed the pool again
    ///
    /// Connections checked out at the time are closed too; releasing them
    /// afterwards reports `NotFound`.
    pub async fn clear(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let closed = inner.drain_and_close("clear").await;
        let initial = inner.config.initial_size.min(inner.config.max_size);
        let seeded = inner.create_idle_batch(initial, inner.config.max_size).await;
        info!(pool = %inner.name, closed, seeded, "Cleared connection pool");
        Ok(())
    }

    /// Shut the pool down
    ///
    /// Stops the background loops, waits for them, then closes every remaining
    /// connection. Later calls return immediately.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }

        info!(pool = %inner.name, "Closing connection pool");
        inner.shutdown.send_replace(true);
        inner.available.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(pool = %inner.name, error = %e, "Background task ended abnormally");
            }
        }

        let closed = inner.drain_and_close("pool closed").await;
        if let Some(registry) = &inner.metrics_registry {
            registry.unregister(&inner.name);
        }
        info!(pool = %inner.name, closed, "Connection pool closed");
    }

    /// Tracked connections, in use or idle
    pub fn size(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.registry().active_count()
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.registry().available_count()
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state().await
    }

    /// Force the circuit breaker closed after the backend was fixed by hand
    pub async fn reset_circuit(&self) {
        self.inner.breaker.reset().await;
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(&self.inner.name)
    }

    pub async fn get_detailed_metrics(&self) -> DetailedMetrics {
        let inner = &self.inner;
        let circuit = inner.breaker.stats().await;
        let load = inner.scaler.lock().await.stats();

        let connections = {
            let registry = inner.registry();
            inner
                .metrics
                .connection_stats()
                .into_iter()
                .filter_map(|(id, stats)| {
                    registry.get(id).map(|record| ConnectionStats {
                        id,
                        in_use: record.in_use,
                        created_at: stats.created_at,
                        age: record.age(),
                        idle: if record.in_use { Duration::ZERO } else { record.idle_for() },
                        usage_count: stats.usage_count,
                        query_count: stats.query_count,
                        avg_query_time: stats.avg_query_time(),
                        validation_failures: stats.validation_failures,
                        reset_count: stats.reset_count,
                        last_query_at: stats.last_query_at,
                    })
                })
                .collect()
        };

        DetailedMetrics {
            summary: self.get_metrics(),
            circuit,
            load,
            connections,
        }
    }

    /// Run one maintenance cycle now instead of waiting for the loop
    pub async fn run_maintenance(&self) -> Result<(), PoolError> {
        if self.inner.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        self.inner.run_maintenance_cycle().await;
        Ok(())
    }

    /// Run one health probe now; the outcome feeds the circuit breaker
    pub async fn check_health(&self) -> Result<(), PoolError> {
        if self.inner.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        self.inner.probe().await
    }
}
