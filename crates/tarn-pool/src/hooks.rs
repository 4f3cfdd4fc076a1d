//! Pool lifecycle hooks
//!
//! Callers customize pool behaviour by implementing [`PoolHooks`]; every
//! method has a no-op default, so implementations override only the points
//! they care about. Hooks must not retain the connection handle beyond the
//! call.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tarn_rdbc::{Connection, ConnectionConfig, Result};

/// Callbacks invoked at pool lifecycle points.
#[async_trait]
pub trait PoolHooks: Send + Sync {
    /// Called before a new physical connection is dialed. Receives a copy of
    /// the connection configuration; mutations apply to this dial only.
    /// An error aborts the dial.
    async fn before_connect(
        &self,
        _ctx: &CancellationToken,
        _config: &mut ConnectionConfig,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after a connection is established, before it enters the pool.
    /// An error discards the connection.
    async fn after_connect(&self, _ctx: &CancellationToken, _conn: &dyn Connection) -> Result<()> {
        Ok(())
    }

    /// Called before a connection is handed to a caller. Returning `false`
    /// destroys the connection and acquires a different one.
    async fn before_acquire(&self, _ctx: &CancellationToken, _conn: &dyn Connection) -> bool {
        true
    }

    /// Called after a caller releases a connection, before it returns to the
    /// pool. Returning `false` destroys the connection.
    async fn after_release(&self, _ctx: &CancellationToken, _conn: &dyn Connection) -> bool {
        true
    }

    /// Called right before a connection is closed and removed from the pool.
    async fn before_close(&self, _ctx: &CancellationToken, _conn: &dyn Connection) {}
}

/// The default hook set: accepts everything, observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl PoolHooks for NoopHooks {}
