use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::connection::ConnectionPool;
use super::error::PoolError;
use super::manager::ConnectionManager;
use super::registry::ConnectionId;

/// A connection checked out of a pool
///
/// Derefs to the underlying connection. Dropping the guard hands the
/// connection back on the current runtime; call [`release`](Self::release)
/// to wait for the hand-back and observe its result.
pub struct PooledConnection<M: ConnectionManager> {
    pool: ConnectionPool<M>,
    id: ConnectionId,
    conn: Arc<M::Connection>,
    released: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub(super) fn new(pool: ConnectionPool<M>, id: ConnectionId, conn: Arc<M::Connection>) -> Self {
        Self {
            pool,
            id,
            conn,
            released: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shared handle to the connection, usable past the guard's borrow
    pub fn handle(&self) -> Arc<M::Connection> {
        Arc::clone(&self.conn)
    }

    pub fn record_query(&self, elapsed: Duration) -> Result<(), PoolError> {
        self.pool.record_query(self.id, elapsed)
    }

    pub fn record_rollback(&self) -> Result<(), PoolError> {
        self.pool.record_rollback(self.id)
    }

    /// Return the connection to the pool now
    pub async fn release(mut self) -> Result<(), PoolError> {
        self.released = true;
        self.pool.release(self.id).await
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let pool = self.pool.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pool.release(id).await {
                        debug!(pool = %pool.name(), connection_id = %id, error = %e, "Deferred release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    pool = %self.pool.name(),
                    connection_id = %id,
                    "Connection guard dropped outside a runtime; connection stays checked out until clear or close"
                );
            }
        }
    }
}
