use std::time::Duration;

use super::circuit::CircuitError;
use super::registry::ConnectionId;

/// Which budget an operation ran out of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Acquire,
    Create,
    Validate,
    Reset,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::Acquire => "acquire",
            TimeoutKind::Create => "connection creation",
            TimeoutKind::Validate => "validation",
            TimeoutKind::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to create connection: {0}")]
    ConnectionCreation(String),

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Timed out during {kind} after {elapsed:?}")]
    Timeout { kind: TimeoutKind, elapsed: Duration },

    #[error("Pool is closed")]
    PoolClosed,

    #[error(transparent)]
    CircuitOpen(#[from] CircuitError),

    #[error("Failed to reset connection {id}: {reason}")]
    ResetFailure { id: ConnectionId, reason: String },

    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    pub(crate) fn timeout(kind: TimeoutKind, elapsed: Duration) -> Self {
        PoolError::Timeout { kind, elapsed }
    }

    /// Whether retrying the same creation could help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::ConnectionCreation(_)
                | PoolError::Timeout { kind: TimeoutKind::Create, .. }
        )
    }
}
