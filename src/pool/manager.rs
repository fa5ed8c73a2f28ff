use async_trait::async_trait;

/// Backend-specific connection lifecycle supplied by the pool's owner
///
/// Only `create` and `close` are required. A manager without a real liveness
/// probe keeps the default `validate`, which treats every connection as alive.
/// `reset` is only consulted when `supports_reset` returns true.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Error: std::fmt::Display + Send + Sync + 'static;

    /// Open a new connection to the backend
    async fn create(&self) -> Result<Self::Connection, Self::Error>;

    /// Close a connection the pool no longer tracks
    async fn close(&self, conn: &Self::Connection) -> Result<(), Self::Error>;

    /// Check that an idle connection is still usable
    async fn validate(&self, _conn: &Self::Connection) -> bool {
        true
    }

    /// Clear per-use state before the connection is handed out again
    async fn reset(&self, _conn: &Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    fn supports_reset(&self) -> bool {
        false
    }
}
