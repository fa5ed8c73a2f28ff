//! Pool metrics
//!
//! Counters are plain atomics so the acquisition path never waits on them.
//! Per-connection statistics live behind their own small mutex, separate from
//! the registry lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use super::circuit::CircuitStats;
use super::registry::ConnectionId;
use super::scaler::LoadStats;

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub created_at: DateTime<Utc>,
    pub usage_count: u64,
    pub query_count: u64,
    pub query_time: Duration,
    /// Drives threshold-based resets
    pub queries_since_reset: u64,
    pub validation_failures: u64,
    pub reset_count: u64,
    pub last_query_at: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            usage_count: 0,
            query_count: 0,
            query_time: Duration::ZERO,
            queries_since_reset: 0,
            validation_failures: 0,
            reset_count: 0,
            last_query_at: None,
        }
    }

    pub fn avg_query_time(&self) -> Duration {
        if self.query_count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.query_time.as_nanos() / u128::from(self.query_count);
            Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
        }
    }
}

/// Pool-wide counters and gauges
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    creation_errors: AtomicU64,
    acquisitions: AtomicU64,
    acquire_timeouts: AtomicU64,
    releases: AtomicU64,
    wait_time_total_us: AtomicU64,
    wait_time_max_us: AtomicU64,
    validations: AtomicU64,
    validation_failures: AtomicU64,
    resets: AtomicU64,
    reset_failures: AtomicU64,
    queries: AtomicU64,
    rollbacks: AtomicU64,
    health_checks: AtomicU64,
    health_check_failures: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    pending_acquisitions: AtomicUsize,
    size: AtomicUsize,
    active: AtomicUsize,
    max_size: AtomicUsize,
    per_connection: Mutex<HashMap<ConnectionId, ConnectionMetrics>>,
}

impl PoolMetrics {
    pub fn new(max_size: usize) -> Self {
        let metrics = Self::default();
        metrics.max_size.store(max_size, Ordering::Relaxed);
        metrics
    }

    fn per_connection(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionMetrics>> {
        // Poisoning only means a panic elsewhere; the counters are still usable
        self.per_connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mirror registry occupancy, called while the registry lock is held
    pub fn update_gauges(&self, size: usize, active: usize) {
        self.size.store(size, Ordering::Relaxed);
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn record_created(&self, id: ConnectionId) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.per_connection().insert(id, ConnectionMetrics::new());
    }

    pub fn record_closed(&self, id: ConnectionId) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.per_connection().remove(&id);
    }

    pub fn record_creation_error(&self) {
        self.creation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquired(&self, id: ConnectionId, waited: Duration) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let waited_us = waited.as_micros().min(u64::MAX as u128) as u64;
        self.wait_time_total_us.fetch_add(waited_us, Ordering::Relaxed);
        self.wait_time_max_us.fetch_max(waited_us, Ordering::Relaxed);
        if let Some(conn) = self.per_connection().get_mut(&id) {
            conn.usage_count += 1;
        }
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn waiter_started(&self) {
        self.pending_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn waiter_finished(&self) {
        self.pending_acquisitions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pending_acquisitions(&self) -> usize {
        self.pending_acquisitions.load(Ordering::Relaxed)
    }

    pub fn record_validation(&self, id: ConnectionId, passed: bool) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.validation_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(conn) = self.per_connection().get_mut(&id) {
                conn.validation_failures += 1;
            }
        }
    }

    pub fn record_reset(&self, id: ConnectionId, succeeded: bool) {
        if succeeded {
            self.resets.fetch_add(1, Ordering::Relaxed);
            if let Some(conn) = self.per_connection().get_mut(&id) {
                conn.reset_count += 1;
                conn.queries_since_reset = 0;
            }
        } else {
            self.reset_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns false if the connection is not tracked
    pub fn record_query(&self, id: ConnectionId, elapsed: Duration) -> bool {
        match self.per_connection().get_mut(&id) {
            Some(conn) => {
                conn.query_count += 1;
                conn.queries_since_reset += 1;
                conn.query_time += elapsed;
                conn.last_query_at = Some(Utc::now());
                self.queries.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries_since_reset(&self, id: ConnectionId) -> u64 {
        self.per_connection()
            .get(&id)
            .map(|conn| conn.queries_since_reset)
            .unwrap_or(0)
    }

    pub fn record_health_check(&self, passed: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.health_check_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_scale_up(&self) {
        self.scale_ups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scale_down(&self) {
        self.scale_downs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionMetrics> {
        self.per_connection().get(&id).cloned()
    }

    /// Immutable view of the counters
    pub fn snapshot(&self, pool: &str) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let size = self.size.load(Ordering::Relaxed);
        let active = self.active.load(Ordering::Relaxed).min(size);
        let max_size = self.max_size.load(Ordering::Relaxed);
        let acquisitions = load(&self.acquisitions);
        let validations = load(&self.validations);
        let validation_failures = load(&self.validation_failures);
        let rollbacks = load(&self.rollbacks);

        MetricsSnapshot {
            pool: pool.to_string(),
            taken_at: Utc::now(),
            size,
            active,
            idle: size - active,
            overflow: size.saturating_sub(max_size),
            pending_acquisitions: self.pending_acquisitions(),
            connections_created: load(&self.connections_created),
            connections_closed: load(&self.connections_closed),
            creation_errors: load(&self.creation_errors),
            acquisitions,
            acquire_timeouts: load(&self.acquire_timeouts),
            releases: load(&self.releases),
            avg_wait_ms: ratio(load(&self.wait_time_total_us), acquisitions) / 1_000.0,
            max_wait_ms: load(&self.wait_time_max_us) as f64 / 1_000.0,
            validations,
            validation_failures,
            validation_failure_rate: ratio(validation_failures, validations),
            resets: load(&self.resets),
            reset_failures: load(&self.reset_failures),
            queries: load(&self.queries),
            rollbacks,
            rollback_rate: ratio(rollbacks, acquisitions),
            health_checks: load(&self.health_checks),
            health_check_failures: load(&self.health_check_failures),
            scale_ups: load(&self.scale_ups),
            scale_downs: load(&self.scale_downs),
        }
    }

    /// Per-connection statistics, ordered by id
    pub fn connection_stats(&self) -> Vec<(ConnectionId, ConnectionMetrics)> {
        let mut stats: Vec<_> = self
            .per_connection()
            .iter()
            .map(|(id, conn)| (*id, conn.clone()))
            .collect();
        stats.sort_by_key(|(id, _)| *id);
        stats
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Point-in-time view of a pool's counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pool: String,
    pub taken_at: DateTime<Utc>,
    pub size: usize,
    pub active: usize,
    pub idle: usize,
    pub overflow: usize,
    pub pending_acquisitions: usize,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub creation_errors: u64,
    pub acquisitions: u64,
    pub acquire_timeouts: u64,
    pub releases: u64,
    pub avg_wait_ms: f64,
    pub max_wait_ms: f64,
    pub validations: u64,
    pub validation_failures: u64,
    pub validation_failure_rate: f64,
    pub resets: u64,
    pub reset_failures: u64,
    pub queries: u64,
    pub rollbacks: u64,
    pub rollback_rate: f64,
    pub health_checks: u64,
    pub health_check_failures: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
}

/// Statistics for one connection as seen in a detailed snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub in_use: bool,
    pub created_at: DateTime<Utc>,
    pub age: Duration,
    pub idle: Duration,
    pub usage_count: u64,
    pub query_count: u64,
    pub avg_query_time: Duration,
    pub validation_failures: u64,
    pub reset_count: u64,
    pub last_query_at: Option<DateTime<Utc>>,
}

/// Summary plus breaker, load and per-connection detail
#[derive(Debug, Clone, Serialize)]
pub struct DetailedMetrics {
    pub summary: MetricsSnapshot,
    pub circuit: CircuitStats,
    pub load: LoadStats,
    pub connections: Vec<ConnectionStats>,
}

/// Shared context for cross-pool diagnostics
///
/// Pools built with a registry publish their metrics under their name for the
/// lifetime of the pool.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pools: RwLock<HashMap<String, Arc<PoolMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, metrics: Arc<PoolMetrics>) {
        if let Ok(mut pools) = self.pools.write() {
            pools.insert(name.to_string(), metrics);
        }
    }

    pub fn unregister(&self, name: &str) {
        if let Ok(mut pools) = self.pools.write() {
            pools.remove(name);
        }
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .map(|pools| pools.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Snapshot every registered pool, ordered by name
    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        let mut snapshots: Vec<MetricsSnapshot> = self
            .pools
            .read()
            .map(|pools| {
                pools
                    .iter()
                    .map(|(name, metrics)| metrics.snapshot(name))
                    .collect()
            })
            .unwrap_or_default();
        snapshots.sort_by(|a, b| a.pool.cmp(&b.pool));
        snapshots
    }
}
