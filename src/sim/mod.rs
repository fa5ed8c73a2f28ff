//! Simulated backend for exercising a pool without a real database
//!
//! Used by the `simulate` command to drive a pool under synthetic load with
//! random connect latency, connect failures and failed validations.

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::pool::{ConnectionManager, ConnectionPool, DetailedMetrics, PoolError};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("simulated backend refused connection")]
    ConnectRefused,

    #[error("simulated backend lost connection {0}")]
    ConnectionLost(u64),
}

/// A fake connection handed out by [`SimulatedBackend`]
#[derive(Debug)]
pub struct SimConnection {
    id: u64,
    queries: AtomicU64,
    max_latency_ms: u64,
}

impl SimConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pretend to run a query; returns how long it took
    pub async fn query(&self) -> Duration {
        let latency = rand::thread_rng().gen_range(0..=self.max_latency_ms);
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(latency)).await;
        self.queries.fetch_add(1, Ordering::Relaxed);
        started.elapsed()
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

/// Connection manager backed by random numbers
pub struct SimulatedBackend {
    config: SimulationConfig,
    next_id: AtomicU64,
    open: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            open: AtomicUsize::new(0),
        }
    }

    /// Connections currently open against the fake backend
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    fn roll(&self, probability: f64) -> bool {
        probability > 0.0 && rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }
}

#[async_trait]
impl ConnectionManager for SimulatedBackend {
    type Connection = SimConnection;
    type Error = SimError;

    async fn create(&self) -> Result<SimConnection, SimError> {
        let latency = rand::thread_rng().gen_range(0..=self.config.connect_latency_ms);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if self.roll(self.config.failure_rate) {
            return Err(SimError::ConnectRefused);
        }

        self.open.fetch_add(1, Ordering::Relaxed);
        Ok(SimConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            queries: AtomicU64::new(0),
            max_latency_ms: self.config.query_latency_ms,
        })
    }

    async fn close(&self, conn: &SimConnection) -> Result<(), SimError> {
        self.open.fetch_sub(1, Ordering::Relaxed);
        debug!(backend_conn = conn.id, queries = conn.queries(), "Simulated connection closed");
        Ok(())
    }

    async fn validate(&self, _conn: &SimConnection) -> bool {
        !self.roll(self.config.validation_failure_rate)
    }

    async fn reset(&self, conn: &SimConnection) -> Result<(), SimError> {
        if self.roll(self.config.validation_failure_rate) {
            return Err(SimError::ConnectionLost(conn.id));
        }
        Ok(())
    }

    fn supports_reset(&self) -> bool {
        true
    }
}

/// Totals from one simulation run
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SimulationReport {
    pub queries: u64,
    pub failed_acquisitions: u64,
    pub rollbacks: u64,
}

/// Drive `pool` with `workers` concurrent callers for `duration`
pub async fn run_load(
    pool: &ConnectionPool<SimulatedBackend>,
    workers: usize,
    duration: Duration,
    rollback_rate: f64,
) -> Result<(SimulationReport, DetailedMetrics), PoolError> {
    pool.start().await?;
    info!(pool = %pool.name(), workers, duration_secs = duration.as_secs_f64(), "Starting simulated load");

    let deadline = Instant::now() + duration;
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut report = SimulationReport::default();
            while Instant::now() < deadline {
                let conn = match pool.get().await {
                    Ok(conn) => conn,
                    Err(PoolError::PoolClosed) => break,
                    Err(e) => {
                        debug!(error = %e, "Simulated acquisition failed");
                        report.failed_acquisitions += 1;
                        continue;
                    }
                };

                let elapsed = conn.query().await;
                let _ = conn.record_query(elapsed);
                report.queries += 1;

                let rolled_back = rand::thread_rng().gen_bool(rollback_rate.clamp(0.0, 1.0));
                if rolled_back {
                    let _ = conn.record_rollback();
                    report.rollbacks += 1;
                }

                let _ = conn.release().await;
            }
            report
        }));
    }

    let mut total = SimulationReport::default();
    for handle in handles {
        if let Ok(report) = handle.await {
            total.queries += report.queries;
            total.failed_acquisitions += report.failed_acquisitions;
            total.rollbacks += report.rollbacks;
        }
    }

    let metrics = pool.get_detailed_metrics().await;
    Ok((total, metrics))
}
