//! End-to-end health probing
//!
//! Independently of the connections in the pool, the health loop opens a
//! throwaway connection, validates it and closes it again. Each probe outcome
//! is fed into the circuit breaker, so a dead backend trips the breaker
//! before callers start seeing creation errors.

use std::sync::Weak;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connection::{pause, PoolInner};
use super::error::{PoolError, TimeoutKind};
use super::manager::ConnectionManager;

pub(super) async fn run_health_checks<M: ConnectionManager>(
    pool: Weak<PoolInner<M>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = match pool.upgrade() {
        Some(pool) => {
            info!(
                pool = %pool.name,
                interval_secs = pool.config.health_check_interval.as_secs_f64(),
                "Health checker started"
            );
            pool.config.health_check_interval
        }
        None => return,
    };

    let mut consecutive_failures = 0u32;
    while pause(&mut shutdown, interval).await {
        let Some(pool) = pool.upgrade() else { break };

        let start = Instant::now();
        let outcome = tokio::select! {
            outcome = pool.probe() => outcome,
            _ = shutdown.changed() => break,
        };
        match outcome {
            Ok(()) => {
                if consecutive_failures > 0 {
                    info!(pool = %pool.name, after_failures = consecutive_failures, "Health probe recovered");
                }
                consecutive_failures = 0;
                debug!(
                    pool = %pool.name,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Health probe passed"
                );
            }
            Err(PoolError::CircuitOpen(e)) => {
                debug!(pool = %pool.name, reason = %e, "Health probe skipped");
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    pool = %pool.name,
                    consecutive_failures,
                    error = %e,
                    "Health probe failed"
                );
            }
        }
    }
}

impl<M: ConnectionManager> PoolInner<M> {
    /// Open, validate and close a throwaway connection
    ///
    /// The probe goes through the circuit breaker like any other creation,
    /// but records a single outcome covering both creation and validation.
    pub(super) async fn probe(&self) -> Result<(), PoolError> {
        self.breaker.check_request().await?;

        let started = Instant::now();
        let conn = match tokio::time::timeout(self.config.connection_timeout, self.manager.create()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return self
                    .probe_failed(PoolError::ConnectionCreation(e.to_string()))
                    .await
            }
            Err(_) => {
                return self
                    .probe_failed(PoolError::timeout(TimeoutKind::Create, started.elapsed()))
                    .await
            }
        };

        let validated = tokio::time::timeout(self.config.validation_timeout, self.manager.validate(&conn)).await;

        self.discard(&conn).await;

        match validated {
            Ok(true) => {
                self.breaker.record_success().await;
                self.metrics.record_health_check(true);
                Ok(())
            }
            Ok(false) => {
                self.probe_failed(PoolError::ValidationFailure("health probe".to_string()))
                    .await
            }
            Err(_) => {
                self.probe_failed(PoolError::timeout(TimeoutKind::Validate, self.config.validation_timeout))
                    .await
            }
        }
    }

    async fn probe_failed(&self, error: PoolError) -> Result<(), PoolError> {
        self.breaker.record_failure().await;
        self.metrics.record_health_check(false);
        Err(error)
    }
}
