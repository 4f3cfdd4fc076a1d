//! # tarn-pool
//!
//! A bounded, health-checked connection pool on top of the
//! [`tarn-rdbc`](tarn_rdbc) driver abstraction.
//!
//! ## Features
//!
//! - Capacity enforced by a semaphore; blocked acquires wake in FIFO order
//! - Idle connections hand out newest-first, with a generation barrier so the
//!   health checker cannot starve unexamined connections
//! - Per-connection lifetime with optional jitter, plus idle-time reaping
//! - Background warmup to a configured minimum and periodic health sweeps
//! - Cancellation-aware acquire: a caller that gives up mid-dial does not
//!   leak the connection being dialed
//! - Lifecycle hooks around connect, acquire, release, and close
//!
//! ## Example
//!
//! ```rust,ignore
//! use tarn_pool::{Pool, PoolConfig};
//! use tarn_rdbc::ConnectionConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! let ctx = CancellationToken::new();
//! let config = PoolConfig::new(ConnectionConfig::new("postgres", "postgres://localhost/app"))
//!     .with_min_connections(2)
//!     .with_max_connections(10);
//!
//! let pool = Pool::new(&ctx, config).await?;
//!
//! let conn = pool.acquire(&ctx).await?;
//! let rows = conn.query("SELECT 1", &[]).await?;
//! pool.release(&ctx, conn);
//!
//! pool.close().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
mod connection;
mod core;
pub mod error;
mod health;
pub mod hooks;
mod mvstack;
mod pool;
mod stats;
mod util;

pub use config::{
    PoolConfig, DEFAULT_HEALTH_CHECK_PERIOD, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_CONNECTION_IDLE_TIME, DEFAULT_MAX_CONNECTION_LIFETIME,
};
pub use connection::PoolConnection;
pub use error::{Error, Result};
pub use hooks::{NoopHooks, PoolHooks};
pub use pool::Pool;
pub use stats::PoolStats;
