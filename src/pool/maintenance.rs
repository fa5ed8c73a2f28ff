//! Maintenance and stats loops
//!
//! Each maintenance cycle evicts expired and idle connections, validates
//! connections that have sat unchecked for a `validation_interval`,
//! replenishes the pool up to `min_size` and finally gives the dynamic
//! scaler a chance to act.

use std::sync::{Arc, Weak};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::connection::{pause, PoolInner};
use super::error::PoolError;
use super::manager::ConnectionManager;
use super::registry::ConnectionId;
use super::scaler::{ScalingDecision, ScalingInput};

pub(super) async fn run_maintenance<M: ConnectionManager>(
    pool: Weak<PoolInner<M>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = match pool.upgrade() {
        Some(pool) => pool.config.maintenance_interval(),
        None => return,
    };
    debug!(interval_ms = interval.as_millis() as u64, "Maintenance loop started");

    while pause(&mut shutdown, interval).await {
        let Some(pool) = pool.upgrade() else { break };
        // A cycle stuck in slow creations must not hold up close()
        tokio::select! {
            _ = pool.run_maintenance_cycle() => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!("Maintenance loop stopped");
}

pub(super) async fn run_stats<M: ConnectionManager>(
    pool: Weak<PoolInner<M>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = match pool.upgrade() {
        Some(pool) => pool.config.stats_emit_interval,
        None => return,
    };

    while pause(&mut shutdown, interval).await {
        let Some(pool) = pool.upgrade() else { break };

        let input = pool.scaling_input();
        pool.scaler.lock().await.record_sample(input.load());

        let snapshot = pool.metrics.snapshot(&pool.name);
        info!(
            pool = %pool.name,
            size = snapshot.size,
            active = snapshot.active,
            idle = snapshot.idle,
            overflow = snapshot.overflow,
            pending = snapshot.pending_acquisitions,
            created = snapshot.connections_created,
            closed = snapshot.connections_closed,
            errors = snapshot.creation_errors,
            avg_wait_ms = snapshot.avg_wait_ms,
            "Pool stats"
        );
    }
}

impl<M: ConnectionManager> PoolInner<M> {
    pub(super) fn scaling_input(&self) -> ScalingInput {
        let registry = self.registry();
        ScalingInput {
            size: registry.len(),
            active: registry.active_count(),
            available: registry.available_count(),
            pending: self.metrics.pending_acquisitions(),
        }
    }

    pub(super) async fn run_maintenance_cycle(self: &Arc<Self>) {
        let config = &self.config;

        let (to_close, to_validate) = {
            let mut registry = self.registry();
            let plan = registry.plan_sweep(
                config.max_lifetime,
                config.idle_timeout,
                config.validation_interval,
                config.min_size,
            );

            let mut to_close = Vec::with_capacity(plan.expired.len() + plan.idle.len());
            for id in &plan.expired {
                if let Some(conn) = registry.remove(*id) {
                    to_close.push((*id, conn, "max lifetime"));
                }
            }
            for id in &plan.idle {
                if let Some(conn) = registry.remove(*id) {
                    to_close.push((*id, conn, "idle timeout"));
                }
            }

            // Held out of circulation until validation finishes
            let to_validate: Vec<_> = plan
                .to_validate
                .iter()
                .filter_map(|id| registry.checkout_id(*id).map(|conn| (*id, conn)))
                .collect();

            self.update_gauges(&registry);
            (to_close, to_validate)
        };

        let evicted = to_close.len();
        for (id, conn, reason) in to_close {
            self.close_connection(id, conn, reason).await;
        }

        let invalid = self.validate_batch(to_validate).await;

        let deficit = {
            let registry = self.registry();
            config
                .min_size
                .saturating_sub(registry.len() + registry.reserved())
        };
        let replenished = if deficit > 0 && !self.is_closed() {
            self.create_idle_batch(deficit, config.max_size).await
        } else {
            0
        };

        if evicted > 0 || invalid > 0 || replenished > 0 {
            debug!(
                pool = %self.name,
                evicted,
                invalid,
                replenished,
                "Maintenance cycle finished"
            );
        }

        if config.scaling_enabled() && !self.is_closed() {
            self.scale().await;
        }
    }

    /// Validate checked-out idle connections with bounded fan-out
    ///
    /// Connections that pass go back to the available set; the rest are
    /// closed. Returns the number of evicted connections.
    async fn validate_batch(self: &Arc<Self>, batch: Vec<(ConnectionId, Arc<M::Connection>)>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_validations));
        let mut tasks = JoinSet::new();
        for (id, conn) in batch {
            let pool = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let passed = tokio::time::timeout(pool.config.validation_timeout, pool.manager.validate(&conn))
                    .await
                    .unwrap_or(false);
                (id, conn, passed)
            });
        }

        let mut evicted = 0;
        while let Some(joined) = tasks.join_next().await {
            let (id, conn, passed) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "Validation task panicked");
                    continue;
                }
            };
            self.metrics.record_validation(id, passed);

            if passed {
                let restored = {
                    let mut registry = self.registry();
                    let restored = registry.restore_validated(id);
                    self.update_gauges(&registry);
                    restored
                };
                if restored {
                    self.available.notify_one();
                }
                continue;
            }

            let failure = PoolError::ValidationFailure(id.to_string());
            debug!(pool = %self.name, error = %failure, "Evicting connection");
            let removed = {
                let mut registry = self.registry();
                let removed = registry.remove(id).is_some();
                self.update_gauges(&registry);
                removed
            };
            if removed {
                self.close_connection(id, conn, "validation failure").await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Consult the scaler and carry out its decision
    ///
    /// Runs under the scaling lock so two decisions never overlap.
    async fn scale(self: &Arc<Self>) {
        let mut scaler = self.scaler.lock().await;

        let input = self.scaling_input();
        if !self.config.stats_enabled {
            scaler.record_sample(input.load());
        }

        match scaler.evaluate(input) {
            ScalingDecision::Hold => {}

            ScalingDecision::ScaleUp(amount) => {
                let created = self.create_idle_batch(amount, self.config.max_size).await;
                if created > 0 {
                    scaler.mark_scaled();
                    self.metrics.record_scale_up();
                    info!(
                        pool = %self.name,
                        requested = amount,
                        created,
                        size = self.registry().len(),
                        "Scaled pool up"
                    );
                }
            }

            ScalingDecision::ScaleDown(amount) => {
                let victims = {
                    let mut registry = self.registry();
                    let mut victims = Vec::with_capacity(amount);
                    for id in registry.least_recently_used(amount) {
                        if registry.len() <= self.config.min_size {
                            break;
                        }
                        if let Some(conn) = registry.remove(id) {
                            victims.push((id, conn));
                        }
                    }
                    self.update_gauges(&registry);
                    victims
                };

                if victims.is_empty() {
                    return;
                }
                let removed = victims.len();
                for (id, conn) in victims {
                    self.close_connection(id, conn, "scale down").await;
                }
                scaler.mark_scaled();
                self.metrics.record_scale_down();
                info!(
                    pool = %self.name,
                    requested = amount,
                    removed,
                    size = self.registry().len(),
                    "Scaled pool down"
                );
            }
        }
    }
}
