//! # tarn-rdbc
//!
//! Driver abstraction for the tarn database toolkit.
//!
//! This crate defines the contracts a database driver implements and the
//! pieces shared between drivers and the pool that sits on top:
//!
//! - **Connection traits**: [`Connection`], [`PreparedStatement`],
//!   [`Transaction`]
//! - **Driver registry**: process-wide, keyed by name; see [`register_driver`]
//!   and [`open`]
//! - **Value model**: [`Value`] and [`Row`]
//! - **Error taxonomy**: [`Error`] with retriability classification
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tarn_rdbc::{open, ConnectionConfig};
//!
//! tarn_rdbc::register_driver(my_driver)?;
//!
//! let db = open(ConnectionConfig::new("postgres", "postgres://localhost/app"))?;
//! let conn = db.connect(&ctx).await?;
//! let rows = conn.query("SELECT 1", &[]).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod driver;
pub mod error;
pub mod types;

pub use connection::{Connection, ConnectionConfig, PreparedStatement, Transaction};
pub use driver::{
    deregister_driver, open, register_driver, registered_drivers, Connector, Database, Driver,
};
pub use error::{Error, ErrorCategory, Result};
pub use types::{Row, Value};
