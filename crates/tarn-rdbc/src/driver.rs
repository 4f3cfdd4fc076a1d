//! Driver registration and database opening
//!
//! Drivers register themselves under a name in a process-wide registry.
//! [`open`] resolves a [`ConnectionConfig`] against the registry and returns a
//! [`Database`], from which physical connections are dialed on demand.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{Error, Result};

/// Produces physical connections for one opened database.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial a new physical connection.
    ///
    /// The configuration is passed per call: callers may hand a mutated copy
    /// of the config the connector was built from, and the mutated copy wins.
    async fn connect(
        &self,
        ctx: &CancellationToken,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Connection>>;
}

/// A database driver, registered once per process under its name.
pub trait Driver: Send + Sync {
    /// The name this driver registers under
    fn name(&self) -> &str;

    /// Build a connector for the given configuration
    fn connector(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connector>>;
}

static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn Driver>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn Driver>>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a driver under its [`Driver::name`].
///
/// Registering two drivers under the same name is an error.
pub fn register_driver(driver: Arc<dyn Driver>) -> Result<()> {
    let name = driver.name().to_string();
    let mut drivers = registry().write();
    if drivers.contains_key(&name) {
        return Err(Error::DuplicateDriver { name });
    }
    tracing::debug!(driver = %name, "registered database driver");
    drivers.insert(name, driver);
    Ok(())
}

/// Remove a driver from the registry, returning whether it was present.
pub fn deregister_driver(name: &str) -> bool {
    registry().write().remove(name).is_some()
}

/// Names of all registered drivers, sorted.
pub fn registered_drivers() -> Vec<String> {
    let mut names: Vec<String> = registry().read().keys().cloned().collect();
    names.sort();
    names
}

/// Validate the configuration, resolve its driver, and open a database handle.
///
/// No network traffic happens here; connections are dialed by
/// [`Database::connect`].
pub fn open(config: ConnectionConfig) -> Result<Database> {
    config.validate()?;
    let driver = registry()
        .read()
        .get(&config.driver_name)
        .cloned()
        .ok_or_else(|| Error::UnknownDriver {
            name: config.driver_name.clone(),
        })?;
    let connector = driver.connector(&config)?;
    Ok(Database { config, connector })
}

/// An opened database: a validated configuration plus its connector.
#[derive(Clone)]
pub struct Database {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
}

impl Database {
    /// The configuration this database was opened with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Dial a new physical connection with the opened configuration
    pub async fn connect(&self, ctx: &CancellationToken) -> Result<Arc<dyn Connection>> {
        self.connector.connect(ctx, &self.config).await
    }

    /// Dial a new physical connection with an overriding configuration
    pub async fn connect_with(
        &self,
        ctx: &CancellationToken,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Connection>> {
        self.connector.connect(ctx, config).await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
