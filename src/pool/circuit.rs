//! Circuit breaker guarding connection creation
//!
//! The breaker has three states:
//! - Closed: creation attempts go through to the factory
//! - Open: the backend is failing, attempts are rejected without calling it
//! - HalfOpen: the recovery timeout has passed, a trial attempt is allowed
//!
//! One breaker is shared by every creation path of a pool: on-demand creation
//! in `acquire()`, seeding, replenishment, scaling and the health probe.

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

/// Circuit breaker error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("Half-open circuit has reached maximum trial requests")]
    HalfOpenLimitReached,
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - creation is allowed
    Closed,

    /// Backend is failing - creation is rejected
    Open {
        /// When the circuit may transition to HalfOpen
        retry_at: Instant,

        /// Consecutive failures recorded when the circuit opened
        failure_count: u32,
    },

    /// Testing recovery - a limited number of trials are allowed
    HalfOpen {
        /// Trials handed out since entering HalfOpen
        trials: u32,

        /// Successful trials so far
        success_count: u32,

        /// When the state was entered
        since: Instant,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Number of successful trials needed to close the circuit from half-open
    pub success_threshold: u32,

    /// How long after the last failure the circuit stays open
    pub recovery_timeout: Duration,

    /// Maximum number of concurrent trials in half-open state
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

impl From<&PoolConfig> for CircuitBreakerConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold,
            recovery_timeout: config.circuit_breaker_recovery,
            ..Default::default()
        }
    }
}

/// Breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    /// Current state name
    pub state: &'static str,

    /// Current run of failures
    pub consecutive_failures: u32,

    pub total_requests: u64,

    pub total_successes: u64,

    pub total_failures: u64,

    /// Attempts short-circuited while open
    pub total_rejections: u64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,
}

struct CircuitCore {
    state: CircuitState,
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    last_failure: Option<Instant>,
    last_transition: Instant,
    open_count: u64,
}

impl CircuitCore {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            config,
            consecutive_failures: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            last_failure: None,
            last_transition: Instant::now(),
            open_count: 0,
        }
    }

    fn check_request(&mut self) -> Result<(), CircuitError> {
        self.total_requests += 1;
        let now = Instant::now();

        match self.state {
            CircuitState::Closed => Ok(()),

            CircuitState::Open { retry_at, .. } => {
                if now >= retry_at {
                    info!("Circuit transitioning from Open to HalfOpen");
                    self.transition_to_half_open();
                    self.take_trial()
                } else {
                    self.total_rejections += 1;
                    Err(CircuitError::CircuitOpen {
                        retry_in: retry_at.saturating_duration_since(now),
                    })
                }
            }

            CircuitState::HalfOpen { trials, since, .. } => {
                // A trial whose outcome never came back must not wedge the breaker
                if trials >= self.config.half_open_max_requests
                    && since.elapsed() < self.config.recovery_timeout
                {
                    self.total_rejections += 1;
                    Err(CircuitError::HalfOpenLimitReached)
                } else {
                    self.take_trial()
                }
            }
        }
    }

    fn take_trial(&mut self) -> Result<(), CircuitError> {
        if let CircuitState::HalfOpen { trials, since, .. } = &mut self.state {
            if since.elapsed() >= self.config.recovery_timeout {
                *trials = 0;
                *since = Instant::now();
            }
            *trials += 1;
        }
        Ok(())
    }

    fn record_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_failures = 0;

        match self.state {
            CircuitState::Closed => {}

            CircuitState::Open { .. } => {
                // An attempt admitted before the circuit opened finished late
                debug!("Recorded success in Open state");
            }

            CircuitState::HalfOpen { trials, success_count, since } => {
                let success_count = success_count + 1;
                if success_count >= self.config.success_threshold {
                    info!(success_count, "Circuit transitioning from HalfOpen to Closed");
                    self.transition_to_closed();
                } else {
                    self.state = CircuitState::HalfOpen { trials, success_count, since };
                }
            }
        }
    }

    fn record_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        let now = Instant::now();
        self.last_failure = Some(now);

        match self.state {
            CircuitState::Closed => {
                debug!(
                    consecutive_failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Creation failed in Closed state"
                );

                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        consecutive_failures = self.consecutive_failures,
                        "Circuit transitioning from Closed to Open"
                    );
                    self.transition_to_open(now);
                }
            }

            CircuitState::Open { failure_count, .. } => {
                // Recovery is measured from the most recent failure
                self.state = CircuitState::Open {
                    retry_at: now + self.config.recovery_timeout,
                    failure_count: failure_count.max(self.consecutive_failures),
                };
            }

            CircuitState::HalfOpen { .. } => {
                warn!("Trial failed in HalfOpen state - reopening circuit");
                self.transition_to_open(now);
            }
        }
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self, now: Instant) {
        self.state = CircuitState::Open {
            retry_at: now + self.config.recovery_timeout,
            failure_count: self.consecutive_failures,
        };
        self.open_count += 1;
        self.last_transition = now;
    }

    fn transition_to_half_open(&mut self) {
        let now = Instant::now();
        self.state = CircuitState::HalfOpen { trials: 0, success_count: 0, since: now };
        self.last_transition = now;
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state.name(),
            consecutive_failures: self.consecutive_failures,
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejections: self.total_rejections,
            open_count: self.open_count,
            time_in_state: self.last_transition.elapsed(),
        }
    }
}

/// Pool-wide circuit breaker
pub struct CircuitBreaker {
    core: Mutex<CircuitCore>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            core: Mutex::new(CircuitCore::new(config)),
        }
    }

    /// Check whether a creation attempt may proceed
    ///
    /// Moves Open to HalfOpen once the recovery timeout has elapsed.
    pub async fn check_request(&self) -> Result<(), CircuitError> {
        self.core.lock().await.check_request()
    }

    pub async fn record_success(&self) {
        self.core.lock().await.record_success();
    }

    pub async fn record_failure(&self) {
        self.core.lock().await.record_failure();
    }

    /// Current state, without triggering the Open to HalfOpen transition
    pub async fn state(&self) -> CircuitState {
        self.core.lock().await.state.clone()
    }

    pub async fn stats(&self) -> CircuitStats {
        self.core.lock().await.stats()
    }

    /// Manually reset the circuit to closed state
    pub async fn reset(&self) {
        info!("Manually resetting circuit to Closed");
        self.core.lock().await.transition_to_closed();
    }
}
