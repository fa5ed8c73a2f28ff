//! Pool configuration and loading
//!
//! `PoolConfig` is the immutable tuning surface of a pool. `Config` wraps it
//! together with the settings the `dbpool` binary needs and can be loaded from
//! a YAML file or from `DBPOOL_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::pool::PoolError;

/// Durations are written as (fractional) seconds in config files
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// How the pool treats connections on their way back from a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    Balanced,
    HighThroughput,
    /// Reset every connection on release
    LowLatency,
    /// Always run the dynamic scaler
    Dynamic,
}

impl PoolStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            PoolStrategy::Balanced => "balanced",
            PoolStrategy::HighThroughput => "high_throughput",
            PoolStrategy::LowLatency => "low_latency",
            PoolStrategy::Dynamic => "dynamic",
        }
    }

    /// Whether a released connection needs a reset before reuse
    pub fn requires_reset(&self, queries_since_reset: u64, reset_after_queries: u64) -> bool {
        match self {
            PoolStrategy::LowLatency => true,
            _ => reset_after_queries > 0 && queries_since_reset >= reset_after_queries,
        }
    }
}

impl std::str::FromStr for PoolStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(PoolStrategy::Balanced),
            "high_throughput" => Ok(PoolStrategy::HighThroughput),
            "low_latency" => Ok(PoolStrategy::LowLatency),
            "dynamic" => Ok(PoolStrategy::Dynamic),
            other => Err(format!("unknown pool strategy: {}", other)),
        }
    }
}

/// Configuration for connection pool behavior
///
/// Immutable once the pool has been constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections created by `start()`
    pub initial_size: usize,

    /// Floor kept alive by the maintenance loop
    pub min_size: usize,

    /// Ceiling for regular (non-overflow) connections
    pub max_size: usize,

    /// Idle connections the scaler tries to keep on hand
    pub target_free_connections: usize,

    /// Idle time after which a connection above `min_size` is closed
    #[serde(with = "secs")]
    pub idle_timeout: Duration,

    /// Age after which an idle connection is closed
    #[serde(with = "secs")]
    pub max_lifetime: Duration,

    /// Budget for a single connection creation
    #[serde(with = "secs")]
    pub connection_timeout: Duration,

    /// Outer ceiling for `acquire()`
    #[serde(with = "secs")]
    pub acquire_timeout: Duration,

    pub strategy: PoolStrategy,

    /// Allow bursting past `max_size`
    pub allow_overflow: bool,

    /// Extra connections allowed when `allow_overflow` is set
    pub max_overflow: usize,

    /// Idle connections are re-validated at this cadence
    #[serde(with = "secs")]
    pub validation_interval: Duration,

    /// Budget for a single validation call
    #[serde(with = "secs")]
    pub validation_timeout: Duration,

    /// Runs the health-check loop
    pub failover_enabled: bool,

    pub dynamic_scaling_enabled: bool,

    /// Load (active / size) at or above which the pool grows
    pub scale_up_threshold: f64,

    /// Load at or below which the pool may shrink
    pub scale_down_threshold: f64,

    /// Minimum time between two scaling events
    #[serde(with = "secs")]
    pub scaling_cool_down: Duration,

    /// Largest growth in one maintenance cycle
    pub scale_up_step: usize,

    /// Largest shrink in one maintenance cycle
    pub scale_down_step: usize,

    /// Spare idle connections tolerated above `target_free_connections`
    pub scale_down_margin: usize,

    /// Creation attempts per acquisition (at least one)
    pub retry_attempts: u32,

    /// Base delay between creation attempts, doubled per attempt
    #[serde(with = "secs")]
    pub retry_backoff: Duration,

    /// Consecutive creation failures that open the circuit
    pub circuit_breaker_threshold: u32,

    /// Time the circuit stays open before a trial creation is allowed
    #[serde(with = "secs")]
    pub circuit_breaker_recovery: Duration,

    #[serde(with = "secs")]
    pub health_check_interval: Duration,

    /// Queries after which a released connection is reset
    pub reset_after_queries: u64,

    /// Fan-out for seeding and replenishment
    pub max_concurrent_creations: usize,

    /// Fan-out for idle validation
    pub max_concurrent_validations: usize,

    /// Budget for closing a single connection
    #[serde(with = "secs")]
    pub close_timeout: Duration,

    /// Log per-connection lifecycle events
    pub log_connections: bool,

    pub stats_enabled: bool,

    #[serde(with = "secs")]
    pub stats_emit_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 5,
            min_size: 2,
            max_size: 20,
            target_free_connections: 2,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            connection_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
            strategy: PoolStrategy::Balanced,
            allow_overflow: false,
            max_overflow: 5,
            validation_interval: Duration::from_secs(60),
            validation_timeout: Duration::from_secs(5),
            failover_enabled: true,
            dynamic_scaling_enabled: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scaling_cool_down: Duration::from_secs(60),
            scale_up_step: 5,
            scale_down_step: 3,
            scale_down_margin: 2,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            reset_after_queries: 100,
            max_concurrent_creations: 10,
            max_concurrent_validations: 5,
            close_timeout: Duration::from_secs(5),
            log_connections: false,
            stats_enabled: true,
            stats_emit_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Hard cap on tracked connections, overflow included
    pub fn max_total(&self) -> usize {
        if self.allow_overflow {
            self.max_size + self.max_overflow
        } else {
            self.max_size
        }
    }

    /// Whether the maintenance loop should consult the scaler
    pub fn scaling_enabled(&self) -> bool {
        self.dynamic_scaling_enabled || self.strategy == PoolStrategy::Dynamic
    }

    /// Maintenance runs at half the validation cadence
    pub fn maintenance_interval(&self) -> Duration {
        (self.validation_interval / 2).max(Duration::from_millis(10))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<(), PoolError> {
        let invalid = |msg: String| Err(PoolError::InvalidConfig(msg));

        if self.max_size == 0 {
            return invalid("max_size must be greater than zero".to_string());
        }
        if self.min_size > self.max_size {
            return invalid(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            ));
        }
        if self.initial_size > self.max_size {
            return invalid(format!(
                "initial_size ({}) exceeds max_size ({})",
                self.initial_size, self.max_size
            ));
        }
        for (name, value) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be within 0.0..=1.0, got {}", name, value));
            }
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return invalid("scale_down_threshold must be below scale_up_threshold".to_string());
        }
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("acquire_timeout", self.acquire_timeout),
            ("validation_interval", self.validation_interval),
            ("validation_timeout", self.validation_timeout),
            ("health_check_interval", self.health_check_interval),
            ("stats_emit_interval", self.stats_emit_interval),
            ("close_timeout", self.close_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("{} must be non-zero", name));
            }
        }
        if self.circuit_breaker_threshold == 0 {
            return invalid("circuit_breaker_threshold must be at least 1".to_string());
        }
        if self.max_concurrent_creations == 0 || self.max_concurrent_validations == 0 {
            return invalid("concurrency limits must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Settings for the `simulate` command's fake backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Probability that opening a connection fails
    pub failure_rate: f64,

    /// Probability that a validation probe reports a dead connection
    pub validation_failure_rate: f64,

    /// Upper bound of the random connect latency in milliseconds
    pub connect_latency_ms: u64,

    /// Upper bound of the random per-query latency in milliseconds
    pub query_latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.05,
            validation_failure_rate: 0.01,
            connect_latency_ms: 20,
            query_latency_ms: 10,
        }
    }
}

fn default_name() -> String {
    "default".to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Pool name used in logs and metrics
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            pool: PoolConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.pool.validate()?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
        Err(_) => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    match env_parse::<f64>(key)? {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid duration for {}: {}", key, e)),
        None => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// Every `PoolConfig` field can be overridden with `DBPOOL_<FIELD>` in upper
/// case, e.g. `DBPOOL_MAX_SIZE=50` or `DBPOOL_IDLE_TIMEOUT=120.5`. The pool
/// name comes from `DBPOOL_NAME`. A `.env` file is honoured when present.
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();
    apply_env(&mut config)?;
    config.pool.validate()?;
    Ok(config)
}

fn apply_env(config: &mut Config) -> Result<()> {
    if let Ok(name) = std::env::var("DBPOOL_NAME") {
        config.name = name;
    }

    let pool = &mut config.pool;

    macro_rules! override_field {
        ($field:ident, $key:literal) => {
            if let Some(value) = env_parse($key)? {
                pool.$field = value;
            }
        };
        ($field:ident, $key:literal, secs) => {
            if let Some(value) = env_secs($key)? {
                pool.$field = value;
            }
        };
    }

    override_field!(initial_size, "DBPOOL_INITIAL_SIZE");
    override_field!(min_size, "DBPOOL_MIN_SIZE");
    override_field!(max_size, "DBPOOL_MAX_SIZE");
    override_field!(target_free_connections, "DBPOOL_TARGET_FREE_CONNECTIONS");
    override_field!(idle_timeout, "DBPOOL_IDLE_TIMEOUT", secs);
    override_field!(max_lifetime, "DBPOOL_MAX_LIFETIME", secs);
    override_field!(connection_timeout, "DBPOOL_CONNECTION_TIMEOUT", secs);
    override_field!(acquire_timeout, "DBPOOL_ACQUIRE_TIMEOUT", secs);
    override_field!(allow_overflow, "DBPOOL_ALLOW_OVERFLOW");
    override_field!(max_overflow, "DBPOOL_MAX_OVERFLOW");
    override_field!(validation_interval, "DBPOOL_VALIDATION_INTERVAL", secs);
    override_field!(failover_enabled, "DBPOOL_FAILOVER_ENABLED");
    override_field!(dynamic_scaling_enabled, "DBPOOL_DYNAMIC_SCALING_ENABLED");
    override_field!(scale_up_threshold, "DBPOOL_SCALE_UP_THRESHOLD");
    override_field!(scale_down_threshold, "DBPOOL_SCALE_DOWN_THRESHOLD");
    override_field!(scaling_cool_down, "DBPOOL_SCALING_COOL_DOWN", secs);
    override_field!(retry_attempts, "DBPOOL_RETRY_ATTEMPTS");
    override_field!(retry_backoff, "DBPOOL_RETRY_BACKOFF", secs);
    override_field!(circuit_breaker_threshold, "DBPOOL_CIRCUIT_BREAKER_THRESHOLD");
    override_field!(circuit_breaker_recovery, "DBPOOL_CIRCUIT_BREAKER_RECOVERY", secs);
    override_field!(health_check_interval, "DBPOOL_HEALTH_CHECK_INTERVAL", secs);
    override_field!(reset_after_queries, "DBPOOL_RESET_AFTER_QUERIES");
    override_field!(log_connections, "DBPOOL_LOG_CONNECTIONS");
    override_field!(stats_enabled, "DBPOOL_STATS_ENABLED");
    override_field!(stats_emit_interval, "DBPOOL_STATS_EMIT_INTERVAL", secs);

    if let Ok(strategy) = std::env::var("DBPOOL_STRATEGY") {
        pool.strategy = strategy.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    }

    Ok(())
}

/// Load configuration from file or environment
///
/// A YAML file wins when given; `DBPOOL_*` variables are still applied on top
/// of it so deployments can tweak single knobs without editing the file.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let mut config = load_from_yaml(path)?;
            apply_env(&mut config)?;
            config.pool.validate()?;
            Ok(config)
        }
        None => load_from_env(),
    }
}
