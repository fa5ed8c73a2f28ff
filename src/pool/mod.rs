//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - A registry-backed pool of long-lived connections with lazy creation
//! - Circuit breaker pattern guarding connection creation
//! - Background eviction, validation, replenishment and health probing
//! - Load-driven dynamic scaling with cool-down
//! - Lock-free pool metrics and a shared cross-pool metrics registry

pub mod circuit;
pub mod connection;
pub mod error;
pub mod guard;
mod health;
mod maintenance;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod scaler;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use connection::{ConnectionPool, PoolState};
pub use error::{PoolError, TimeoutKind};
pub use guard::PooledConnection;
pub use manager::ConnectionManager;
pub use metrics::{
    ConnectionMetrics, ConnectionStats, DetailedMetrics, MetricsRegistry, MetricsSnapshot, PoolMetrics,
};
pub use registry::ConnectionId;
pub use scaler::{LoadStats, ScalingDecision};
