//! dbpool - Self-managing async connection pool
//!
//! Hands out long-lived connections from any [`ConnectionManager`] to
//! concurrent callers, guards creation with a circuit breaker, and keeps
//! itself healthy with background eviction, validation, health probing and
//! load-driven scaling.

pub mod cli;
pub mod config;
pub mod pool;
pub mod sim;

pub use config::{Config, PoolConfig, PoolStrategy};
pub use pool::{ConnectionManager, ConnectionPool, PoolError, PooledConnection};
