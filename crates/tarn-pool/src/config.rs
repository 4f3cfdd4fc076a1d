//! Pool configuration

use std::sync::Arc;
use std::time::Duration;

use tarn_rdbc::ConnectionConfig;

use crate::hooks::PoolHooks;

/// Default maximum connection lifetime (1 hour)
pub const DEFAULT_MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(60 * 60);
/// Default maximum idle time before a connection is reaped (30 minutes)
pub const DEFAULT_MAX_CONNECTION_IDLE_TIME: Duration = Duration::from_secs(30 * 60);
/// Default pool capacity
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;
/// Default period between health-check sweeps (1 minute)
pub const DEFAULT_HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Configuration for creating a [`Pool`](crate::Pool).
#[derive(Clone)]
pub struct PoolConfig {
    /// How to reach the database
    pub connection: ConnectionConfig,

    /// Lifecycle hooks; resolved to the no-op set at pool construction
    pub hooks: Option<Arc<dyn PoolHooks>>,

    /// Duration since creation after which a connection is destroyed instead
    /// of reused
    pub max_connection_lifetime: Duration,

    /// Upper bound of the uniform random smear added to each connection's
    /// lifetime, preventing synchronized expiry
    pub max_connection_lifetime_jitter: Duration,

    /// Duration after which an idle connection is closed by the health check
    pub max_connection_idle_time: Duration,

    /// Maximum number of connections (pool capacity)
    pub max_connections: u32,

    /// Minimum number of connections the health checker keeps warm. The pool
    /// may dip below this after destroys until the next health-check sweep.
    pub min_connections: u32,

    /// Period between health-check sweeps of idle connections
    pub health_check_period: Duration,
}

impl PoolConfig {
    /// Create a configuration with defaults for everything but the
    /// connection settings.
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            hooks: None,
            max_connection_lifetime: DEFAULT_MAX_CONNECTION_LIFETIME,
            max_connection_lifetime_jitter: Duration::ZERO,
            max_connection_idle_time: DEFAULT_MAX_CONNECTION_IDLE_TIME,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 0,
            health_check_period: DEFAULT_HEALTH_CHECK_PERIOD,
        }
    }

    /// Set the lifecycle hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn PoolHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Set the maximum connection lifetime
    pub fn with_max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_connection_lifetime = lifetime;
        self
    }

    /// Set the lifetime jitter bound
    pub fn with_max_connection_lifetime_jitter(mut self, jitter: Duration) -> Self {
        self.max_connection_lifetime_jitter = jitter;
        self
    }

    /// Set the idle reaping threshold
    pub fn with_max_connection_idle_time(mut self, idle_time: Duration) -> Self {
        self.max_connection_idle_time = idle_time;
        self
    }

    /// Set the pool capacity
    pub fn with_max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the warm minimum
    pub fn with_min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the health-check period
    pub fn with_health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
        self
    }

    /// Validate the nested connection config and replace zeroed settings
    /// with their defaults.
    pub(crate) fn validate_and_default(&mut self) -> tarn_rdbc::Result<()> {
        self.connection.validate()?;
        if self.max_connection_lifetime.is_zero() {
            self.max_connection_lifetime = DEFAULT_MAX_CONNECTION_LIFETIME;
        }
        if self.max_connection_idle_time.is_zero() {
            self.max_connection_idle_time = DEFAULT_MAX_CONNECTION_IDLE_TIME;
        }
        if self.max_connections == 0 {
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        if self.health_check_period.is_zero() {
            self.health_check_period = DEFAULT_HEALTH_CHECK_PERIOD;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("connection", &self.connection)
            .field("hooks", &self.hooks.as_ref().map(|_| "custom"))
            .field("max_connection_lifetime", &self.max_connection_lifetime)
            .field(
                "max_connection_lifetime_jitter",
                &self.max_connection_lifetime_jitter,
            )
            .field("max_connection_idle_time", &self.max_connection_idle_time)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("health_check_period", &self.health_check_period)
            .finish()
    }
}
