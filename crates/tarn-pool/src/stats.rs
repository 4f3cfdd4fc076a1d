//! Pool statistics

use std::sync::atomic::AtomicU64;
use std::time::Duration;

/// Cross-task counters updated without the pool mutex.
#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
    /// Physical connections dialed (including failed attempts)
    pub(crate) new_connections: AtomicU64,
    /// Connections destroyed because they outlived their age deadline or were
    /// vetoed on release
    pub(crate) lifetime_destroys: AtomicU64,
    /// Connections destroyed because they sat idle past the idle threshold
    pub(crate) idle_destroys: AtomicU64,
    /// Acquires abandoned because the caller's token fired
    pub(crate) canceled_acquires: AtomicU64,
}

/// A point-in-time snapshot of pool statistics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Physical connections dialed since the pool was created
    pub new_connections_count: u64,
    /// Destroys due to the age deadline or a release veto
    pub lifetime_destroy_count: u64,
    /// Destroys due to idleness
    pub idle_destroy_count: u64,
    /// Acquires canceled by the caller
    pub canceled_acquire_count: u64,
    /// Successful acquires
    pub acquire_count: u64,
    /// Cumulative time callers spent inside acquire
    pub acquire_duration: Duration,
    /// Acquires that had to wait for capacity or dial a fresh connection
    pub empty_acquire_count: u64,
    /// Live connections (initialising, idle, or acquired)
    pub total_connections: usize,
    /// Connections currently idle in the pool
    pub idle_connections: usize,
    /// Configured capacity
    pub max_connections: u32,
}

impl PoolStats {
    /// Mean wall-clock time spent per successful acquire.
    pub fn mean_acquire_duration(&self) -> Duration {
        if self.acquire_count == 0 {
            return Duration::ZERO;
        }
        self.acquire_duration / u32::try_from(self.acquire_count).unwrap_or(u32::MAX)
    }
}
