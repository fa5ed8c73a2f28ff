//! Integration tests for the connection pool
//!
//! These tests drive a pool over an in-memory connection manager and verify
//! sizing, waiting, resets, validation, circuit breaking and shutdown in
//! realistic scenarios.

use async_trait::async_trait;
use dbpool::config::{PoolConfig, PoolStrategy};
use dbpool::pool::{
    CircuitState, ConnectionManager, ConnectionPool, MetricsRegistry, PoolError, PoolState, TimeoutKind,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    create_calls: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
    resets: AtomicUsize,
    create_delay_ms: AtomicU64,
    fail_create: AtomicBool,
    fail_validate: AtomicBool,
    fail_reset: AtomicBool,
}

impl MockState {
    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("mock backend unavailable")]
struct MockError;

struct MockConn {
    serial: usize,
}

struct MockManager {
    state: Arc<MockState>,
    supports_reset: bool,
}

impl MockManager {
    fn new() -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let manager = Self {
            state: Arc::clone(&state),
            supports_reset: false,
        };
        (manager, state)
    }

    fn with_reset() -> (Self, Arc<MockState>) {
        let (mut manager, state) = Self::new();
        manager.supports_reset = true;
        (manager, state)
    }
}

#[async_trait]
impl ConnectionManager for MockManager {
    type Connection = MockConn;
    type Error = MockError;

    async fn create(&self) -> Result<MockConn, MockError> {
        self.state.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(MockError);
        }
        let serial = self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn { serial })
    }

    async fn close(&self, _conn: &MockConn) -> Result<(), MockError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, _conn: &MockConn) -> bool {
        !self.state.fail_validate.load(Ordering::SeqCst)
    }

    async fn reset(&self, _conn: &MockConn) -> Result<(), MockError> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_reset.load(Ordering::SeqCst) {
            return Err(MockError);
        }
        Ok(())
    }

    fn supports_reset(&self) -> bool {
        self.supports_reset
    }
}

/// A config with every background actor except maintenance switched off and
/// maintenance slowed down, so sizes only change through the test
fn quiet_config() -> PoolConfig {
    PoolConfig {
        initial_size: 2,
        min_size: 2,
        max_size: 5,
        acquire_timeout: Duration::from_secs(1),
        validation_interval: Duration::from_secs(60),
        failover_enabled: false,
        dynamic_scaling_enabled: false,
        stats_enabled: false,
        retry_attempts: 1,
        retry_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_start_seeds_initial_connections() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("seed", manager, PoolConfig {
        initial_size: 3,
        ..quiet_config()
    })
    .unwrap();

    assert_eq!(pool.state(), PoolState::NotStarted);
    assert_eq!(pool.size(), 0);

    pool.start().await.unwrap();
    assert_eq!(pool.state(), PoolState::Running);
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.idle_connections(), 3);
    assert_eq!(state.created(), 3);

    // Starting again is a no-op
    pool.start().await.unwrap();
    assert_eq!(state.created(), 3);

    pool.close().await;
}

#[tokio::test]
async fn test_acquire_release_keeps_size() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("reuse", manager, quiet_config()).unwrap();
    pool.start().await.unwrap();

    let (id, _conn) = pool.acquire().await.unwrap();
    assert_eq!(pool.active_connections(), 1);
    assert_eq!(pool.size(), 2);

    pool.release(id).await.unwrap();
    assert_eq!(pool.active_connections(), 0);
    assert_eq!(pool.size(), 2);
    assert_eq!(state.created(), 2);

    let metrics = pool.get_metrics();
    assert_eq!(metrics.acquisitions, 1);
    assert_eq!(metrics.releases, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_acquire_starts_pool_lazily() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("lazy", manager, quiet_config()).unwrap();

    let (id, _conn) = pool.acquire().await.unwrap();
    assert_eq!(pool.state(), PoolState::Running);
    assert_eq!(state.created(), 2);
    pool.release(id).await.unwrap();

    pool.close().await;
}

#[tokio::test]
async fn test_concurrent_acquires_get_distinct_connections() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("distinct", manager, PoolConfig {
        initial_size: 0,
        min_size: 0,
        max_size: 10,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.acquire().await }));
    }

    let mut ids = HashSet::new();
    let mut serials = HashSet::new();
    for handle in handles {
        let (id, conn) = handle.await.unwrap().unwrap();
        ids.insert(id);
        serials.insert(conn.serial);
    }

    assert_eq!(ids.len(), 10);
    assert_eq!(serials.len(), 10);
    assert_eq!(state.created(), 10);
    assert_eq!(pool.active_connections(), 10);

    pool.close().await;
}

#[tokio::test]
async fn test_exhausted_pool_waits_for_release() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("exhausted", manager, PoolConfig {
        acquire_timeout: Duration::from_millis(300),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap().0);
    }
    assert_eq!(pool.size(), 5);

    match pool.acquire().await {
        Err(PoolError::Timeout { kind, .. }) => assert_eq!(kind, TimeoutKind::Acquire),
        other => panic!("expected acquire timeout, got {:?}", other.map(|(id, _)| id)),
    }
    assert_eq!(pool.get_metrics().acquire_timeouts, 1);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let released = held.pop().unwrap();
    pool.release(released).await.unwrap();

    let (id, _conn) = waiter.await.unwrap().unwrap();
    assert_eq!(id, released);
    assert_eq!(pool.size(), 5);
    assert_eq!(pool.active_connections(), 5);

    pool.close().await;
}

#[tokio::test]
async fn test_failed_reset_discards_connection() {
    let (manager, state) = MockManager::with_reset();
    state.fail_reset.store(true, Ordering::SeqCst);
    let pool = ConnectionPool::new("reset-fail", manager, PoolConfig {
        strategy: PoolStrategy::LowLatency,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let (id, _conn) = pool.acquire().await.unwrap();
    pool.release(id).await.unwrap();

    assert!(eventually(|| state.closed() == 1).await);
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.active_connections(), 0);
    assert_eq!(pool.get_metrics().reset_failures, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_successful_reset_returns_connection() {
    let (manager, state) = MockManager::with_reset();
    let pool = ConnectionPool::new("reset-ok", manager, PoolConfig {
        strategy: PoolStrategy::LowLatency,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let (id, _conn) = pool.acquire().await.unwrap();
    pool.release(id).await.unwrap();

    assert!(eventually(|| pool.idle_connections() == 2).await);
    assert_eq!(state.resets.load(Ordering::SeqCst), 1);
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.get_metrics().resets, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_balanced_strategy_resets_after_query_threshold() {
    let (manager, state) = MockManager::with_reset();
    let pool = ConnectionPool::new("reset-threshold", manager, PoolConfig {
        strategy: PoolStrategy::Balanced,
        reset_after_queries: 2,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let (id, _conn) = pool.acquire().await.unwrap();
    pool.record_query(id, Duration::from_millis(3)).unwrap();
    pool.release(id).await.unwrap();
    assert_eq!(state.resets.load(Ordering::SeqCst), 0);

    let (id, _conn) = pool.acquire().await.unwrap();
    pool.record_query(id, Duration::from_millis(3)).unwrap();
    pool.record_query(id, Duration::from_millis(3)).unwrap();
    pool.release(id).await.unwrap();

    assert!(eventually(|| state.resets.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| pool.idle_connections() == 2).await);

    pool.close().await;
}

#[tokio::test]
async fn test_invalid_connections_are_replaced() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("validation", manager, PoolConfig {
        validation_interval: Duration::from_millis(100),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();
    assert_eq!(state.created(), 2);

    state.fail_validate.store(true, Ordering::SeqCst);
    assert!(eventually(|| state.closed() >= 2 && state.created() >= 4).await);

    state.fail_validate.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.run_maintenance().await.unwrap();

    assert_eq!(pool.size(), 2);
    assert!(pool.get_metrics().validation_failures >= 2);

    pool.close().await;
}

#[tokio::test]
async fn test_circuit_opens_after_failures() {
    let (manager, state) = MockManager::new();
    state.fail_create.store(true, Ordering::SeqCst);
    let pool = ConnectionPool::new("breaker", manager, PoolConfig {
        initial_size: 0,
        min_size: 0,
        circuit_breaker_threshold: 5,
        circuit_breaker_recovery: Duration::from_secs(60),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    for attempt in 1..=5 {
        match pool.acquire().await {
            Err(PoolError::ConnectionCreation(_)) => {}
            other => panic!("attempt {}: expected creation failure, got {:?}", attempt, other.map(|(id, _)| id)),
        }
    }
    assert_eq!(state.create_calls.load(Ordering::SeqCst), 5);
    assert!(pool.circuit_state().await.is_open());

    assert!(matches!(pool.acquire().await, Err(PoolError::CircuitOpen(_))));
    assert_eq!(state.create_calls.load(Ordering::SeqCst), 5);

    let metrics = pool.get_detailed_metrics().await;
    assert_eq!(metrics.summary.creation_errors, 5);
    assert_eq!(metrics.circuit.state, "open");

    state.fail_create.store(false, Ordering::SeqCst);
    pool.reset_circuit().await;
    let (id, _conn) = pool.acquire().await.unwrap();
    assert_eq!(pool.circuit_state().await, CircuitState::Closed);
    pool.release(id).await.unwrap();

    pool.close().await;
}

#[tokio::test]
async fn test_circuit_recovers_after_timeout() {
    let (manager, state) = MockManager::new();
    state.fail_create.store(true, Ordering::SeqCst);
    let pool = ConnectionPool::new("recovery", manager, PoolConfig {
        initial_size: 0,
        min_size: 0,
        circuit_breaker_threshold: 2,
        circuit_breaker_recovery: Duration::from_millis(100),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    assert!(pool.acquire().await.is_err());
    assert!(pool.acquire().await.is_err());
    assert!(pool.circuit_state().await.is_open());

    state.fail_create.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (id, _conn) = pool.acquire().await.unwrap();
    assert_eq!(pool.circuit_state().await, CircuitState::Closed);
    pool.release(id).await.unwrap();

    pool.close().await;
}

#[tokio::test]
async fn test_health_probe_feeds_breaker() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("probe", manager, PoolConfig {
        initial_size: 0,
        min_size: 0,
        circuit_breaker_threshold: 2,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    pool.check_health().await.unwrap();
    assert_eq!(state.created(), 1);
    assert_eq!(state.closed(), 1);
    assert_eq!(pool.size(), 0);

    state.fail_validate.store(true, Ordering::SeqCst);
    assert!(matches!(pool.check_health().await, Err(PoolError::ValidationFailure(_))));
    assert!(pool.check_health().await.is_err());
    assert!(pool.circuit_state().await.is_open());
    assert!(matches!(pool.check_health().await, Err(PoolError::CircuitOpen(_))));

    let metrics = pool.get_metrics();
    assert_eq!(metrics.health_checks, 3);
    assert_eq!(metrics.health_check_failures, 2);

    pool.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("close", manager, PoolConfig {
        initial_size: 3,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let (held, _conn) = pool.acquire().await.unwrap();

    pool.close().await;
    pool.close().await;

    assert_eq!(pool.state(), PoolState::Closed);
    assert_eq!(state.closed(), 3);
    assert_eq!(pool.size(), 0);

    assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));
    assert!(matches!(pool.release(held).await, Err(PoolError::PoolClosed)));
    assert!(matches!(pool.start().await, Err(PoolError::PoolClosed)));
}

#[tokio::test]
async fn test_close_wakes_waiters() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("close-waiters", manager, PoolConfig {
        initial_size: 1,
        min_size: 1,
        max_size: 1,
        acquire_timeout: Duration::from_secs(10),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();
    let _held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.close().await;
    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(PoolError::PoolClosed)));
}

#[tokio::test]
async fn test_overflow_connections_closed_on_release() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("overflow", manager, PoolConfig {
        initial_size: 0,
        min_size: 0,
        max_size: 2,
        allow_overflow: true,
        max_overflow: 1,
        acquire_timeout: Duration::from_millis(100),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap().0);
    }
    assert_eq!(pool.size(), 3);
    assert!(pool.acquire().await.is_err());
    assert_eq!(pool.get_metrics().overflow, 1);

    pool.release(held[0]).await.unwrap();
    assert_eq!(pool.size(), 2);
    assert_eq!(state.closed(), 1);

    pool.release(held[1]).await.unwrap();
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.idle_connections(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_release_edge_cases() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("release", manager, quiet_config()).unwrap();
    pool.start().await.unwrap();

    let (id, _conn) = pool.acquire().await.unwrap();
    pool.release(id).await.unwrap();
    // A second release of the same connection is a no-op
    pool.release(id).await.unwrap();
    assert_eq!(pool.idle_connections(), 2);

    let unknown = dbpool::pool::ConnectionId::from(999);
    assert!(matches!(pool.release(unknown).await, Err(PoolError::NotFound(_))));
    assert!(matches!(
        pool.record_query(unknown, Duration::from_millis(1)),
        Err(PoolError::NotFound(_))
    ));

    pool.close().await;
}

#[tokio::test]
async fn test_with_connection_and_guard_release() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("scoped", manager, quiet_config()).unwrap();
    pool.start().await.unwrap();

    let serial = pool.with_connection(|conn| async move { conn.serial }).await.unwrap();
    assert!(serial < 2);
    assert_eq!(pool.active_connections(), 0);

    {
        let guard = pool.get().await.unwrap();
        guard.record_query(Duration::from_millis(2)).unwrap();
        guard.record_rollback().unwrap();
        assert_eq!(pool.active_connections(), 1);
    }
    assert!(eventually(|| pool.active_connections() == 0).await);

    let metrics = pool.get_metrics();
    assert_eq!(metrics.queries, 1);
    assert_eq!(metrics.rollbacks, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_clear_reseeds_pool() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("clear", manager, quiet_config()).unwrap();
    pool.start().await.unwrap();

    let (held, _conn) = pool.acquire().await.unwrap();
    pool.clear().await.unwrap();

    assert_eq!(state.closed(), 2);
    assert_eq!(state.created(), 4);
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.active_connections(), 0);
    assert!(matches!(pool.release(held).await, Err(PoolError::NotFound(_))));

    pool.close().await;
}

#[tokio::test]
async fn test_dynamic_scaling_keeps_free_connections() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("scaling", manager, PoolConfig {
        initial_size: 1,
        min_size: 1,
        max_size: 10,
        target_free_connections: 3,
        validation_interval: Duration::from_millis(40),
        scaling_cool_down: Duration::from_millis(10),
        dynamic_scaling_enabled: true,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    assert!(eventually(|| pool.idle_connections() >= 3).await);
    assert!(pool.size() <= 10);
    assert!(pool.get_metrics().scale_ups >= 1);

    pool.close().await;
}

#[tokio::test]
async fn test_detailed_metrics_cover_every_connection() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("detail", manager, PoolConfig {
        initial_size: 3,
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let (id, _conn) = pool.acquire().await.unwrap();
    pool.record_query(id, Duration::from_millis(8)).unwrap();

    let detail = pool.get_detailed_metrics().await;
    assert_eq!(detail.connections.len(), 3);
    let busy = detail.connections.iter().find(|c| c.id == id).unwrap();
    assert!(busy.in_use);
    assert_eq!(busy.query_count, 1);
    assert_eq!(busy.avg_query_time, Duration::from_millis(8));
    assert_eq!(detail.summary.active, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_metrics_registry_tracks_pool_lifetime() {
    let registry = Arc::new(MetricsRegistry::new());
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::with_registry("orders", manager, quiet_config(), Arc::clone(&registry)).unwrap();
    pool.start().await.unwrap();

    assert_eq!(registry.pool_names(), vec!["orders".to_string()]);
    let snapshots = registry.snapshot_all();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].size, 2);

    pool.close().await;
    assert!(registry.pool_names().is_empty());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (manager, _state) = MockManager::new();
    let result = ConnectionPool::new("broken", manager, PoolConfig {
        min_size: 10,
        max_size: 5,
        ..quiet_config()
    });
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_cancelled_acquire_stops_counting_as_pending() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("cancelled", manager, PoolConfig {
        initial_size: 1,
        min_size: 1,
        max_size: 1,
        acquire_timeout: Duration::from_secs(10),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let (held, _conn) = pool.acquire().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
    assert!(outcome.is_err());
    assert_eq!(pool.get_metrics().pending_acquisitions, 0);

    pool.release(held).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.get_metrics().pending_acquisitions, 0);
    assert_eq!(pool.idle_connections(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_release_wakes_exactly_one_waiter() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("one-waiter", manager, PoolConfig {
        acquire_timeout: Duration::from_secs(5),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.acquire().await }));
    }
    let mut held = Vec::new();
    for handle in handles {
        held.push(handle.await.unwrap().unwrap().0);
    }
    assert_eq!(pool.size(), 5);
    assert_eq!(pool.active_connections(), 5);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        })
        .collect();
    assert!(eventually(|| pool.get_metrics().pending_acquisitions == 3).await);
    assert_eq!(pool.size(), 5);

    pool.release(held[0]).await.unwrap();
    assert!(eventually(|| waiters.iter().filter(|w| w.is_finished()).count() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(waiters.iter().filter(|w| w.is_finished()).count(), 1);
    assert_eq!(pool.get_metrics().pending_acquisitions, 2);
    assert_eq!(pool.active_connections(), 5);

    pool.close().await;
    let mut served = 0;
    let mut closed = 0;
    for waiter in waiters {
        match waiter.await.unwrap() {
            Ok((id, _)) => {
                assert_eq!(id, held[0]);
                served += 1;
            }
            Err(PoolError::PoolClosed) => closed += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((served, closed), (1, 2));
}

fn scaling_config() -> PoolConfig {
    PoolConfig {
        initial_size: 6,
        min_size: 2,
        max_size: 10,
        target_free_connections: 1,
        scale_down_margin: 1,
        scale_down_step: 3,
        scaling_cool_down: Duration::from_secs(60),
        dynamic_scaling_enabled: true,
        ..quiet_config()
    }
}

#[tokio::test]
async fn test_scale_down_removes_least_recently_used() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("scale-down", manager, scaling_config()).unwrap();
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Touch three connections so they become the most recently used
    let mut recent = Vec::new();
    for _ in 0..3 {
        recent.push(pool.acquire().await.unwrap().0);
    }
    for id in &recent {
        pool.release(*id).await.unwrap();
    }

    pool.run_maintenance().await.unwrap();

    assert_eq!(pool.size(), 3);
    assert_eq!(state.closed(), 3);
    assert_eq!(pool.get_metrics().scale_downs, 1);
    let survivors: HashSet<_> = pool
        .get_detailed_metrics()
        .await
        .connections
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(survivors, recent.iter().copied().collect::<HashSet<_>>());

    pool.close().await;
}

#[tokio::test]
async fn test_scaling_cool_down_blocks_next_event() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("cool-down", manager, scaling_config()).unwrap();
    pool.start().await.unwrap();

    pool.run_maintenance().await.unwrap();
    assert_eq!(pool.size(), 3);

    // Still over target plus margin, but inside the cool-down
    pool.run_maintenance().await.unwrap();
    pool.run_maintenance().await.unwrap();
    assert_eq!(pool.size(), 3);
    assert_eq!(state.closed(), 3);
    assert_eq!(pool.get_metrics().scale_downs, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_scale_down_stops_at_min_size() {
    let (manager, _state) = MockManager::new();
    let pool = ConnectionPool::new("scale-floor", manager, PoolConfig {
        min_size: 4,
        target_free_connections: 0,
        scale_down_margin: 0,
        scaling_cool_down: Duration::ZERO,
        ..scaling_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    pool.run_maintenance().await.unwrap();
    assert_eq!(pool.size(), 4);

    pool.run_maintenance().await.unwrap();
    assert_eq!(pool.size(), 4);
    assert_eq!(pool.get_metrics().scale_downs, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_idle_connections_evicted_down_to_min_size() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("idle", manager, PoolConfig {
        initial_size: 3,
        min_size: 1,
        idle_timeout: Duration::from_millis(50),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    pool.run_maintenance().await.unwrap();

    assert_eq!(pool.size(), 1);
    assert_eq!(state.closed(), 2);
    assert_eq!(state.created(), 3);

    pool.close().await;
}

#[tokio::test]
async fn test_expired_connections_replaced_but_in_use_kept() {
    let (manager, state) = MockManager::new();
    let pool = ConnectionPool::new("lifetime", manager, PoolConfig {
        max_lifetime: Duration::from_millis(50),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    let (busy, _conn) = pool.acquire().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    pool.run_maintenance().await.unwrap();

    // Only the idle one expired; replenishment brings the pool back to min_size
    assert_eq!(state.closed(), 1);
    assert_eq!(state.created(), 3);
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.active_connections(), 1);
    pool.release(busy).await.unwrap();

    pool.close().await;
}

#[tokio::test]
async fn test_health_loop_follows_failover_flag() {
    let config = PoolConfig {
        initial_size: 0,
        min_size: 0,
        health_check_interval: Duration::from_millis(20),
        ..quiet_config()
    };

    let (manager, _state) = MockManager::new();
    let enabled = ConnectionPool::new("failover-on", manager, PoolConfig {
        failover_enabled: true,
        ..config.clone()
    })
    .unwrap();
    enabled.start().await.unwrap();
    assert!(eventually(|| enabled.get_metrics().health_checks >= 2).await);
    enabled.close().await;

    let (manager, state) = MockManager::new();
    let disabled = ConnectionPool::new("failover-off", manager, config).unwrap();
    disabled.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(disabled.get_metrics().health_checks, 0);
    assert_eq!(state.create_calls.load(Ordering::SeqCst), 0);
    disabled.close().await;
}

#[tokio::test]
async fn test_close_interrupts_slow_maintenance() {
    let (manager, state) = MockManager::new();
    state.create_delay_ms.store(5_000, Ordering::SeqCst);
    let pool = ConnectionPool::new("slow-close", manager, PoolConfig {
        initial_size: 0,
        min_size: 1,
        validation_interval: Duration::from_millis(40),
        ..quiet_config()
    })
    .unwrap();
    pool.start().await.unwrap();

    // Replenishment is now stuck inside a slow creation
    assert!(eventually(|| state.create_calls.load(Ordering::SeqCst) >= 1).await);

    tokio::time::timeout(Duration::from_secs(1), pool.close())
        .await
        .expect("close waited for an in-flight creation");
    assert_eq!(pool.state(), PoolState::Closed);
    assert_eq!(pool.size(), 0);
}
