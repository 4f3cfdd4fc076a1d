//! Error types for tarn-pool

use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by pool operations
#[derive(Error, Debug)]
pub enum Error {
    /// The pool has been closed
    #[error("pool is closed")]
    Closed,

    /// No capacity is currently available for a new connection
    #[error("no pool capacity available")]
    SpaceNotAvailable,

    /// The caller's cancellation token fired before a connection was acquired
    #[error("acquire canceled")]
    Canceled,

    /// Error from the driver layer
    #[error(transparent)]
    Rdbc(#[from] tarn_rdbc::Error),
}
