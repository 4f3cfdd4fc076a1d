//! Pooled connection record and the caller-facing connection guard

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use tarn_rdbc::Connection;

use crate::pool::Pool;

/// Lifecycle state of a pooled connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnStatus {
    /// Registered, but the physical connection is still being dialed
    Initialising = 0,
    /// Sitting on the idle stack, ready for handout
    Idle = 1,
    /// Owned by a caller or by the health checker
    Acquired = 2,
}

/// Lifecycle metadata for one physical connection.
///
/// Created only by the pool. Status and registry membership are mutated under
/// the pool mutex; the last-used timestamp is the one field written outside
/// it, atomically, on release.
pub(crate) struct ConnRecord {
    conn: OnceLock<Arc<dyn Connection>>,
    status: AtomicU8,
    created_at: Instant,
    max_age_at: Instant,
    /// Nanoseconds since `created_at` at which the connection was last used
    last_used_nanos: AtomicU64,
}

impl ConnRecord {
    pub(crate) fn new(max_lifetime: Duration, jitter: Duration) -> Arc<Self> {
        let jitter_secs = rand::random::<f64>() * jitter.as_secs_f64();
        let now = Instant::now();
        Arc::new(Self {
            conn: OnceLock::new(),
            status: AtomicU8::new(ConnStatus::Initialising as u8),
            created_at: now,
            max_age_at: now + max_lifetime + Duration::from_secs_f64(jitter_secs),
            last_used_nanos: AtomicU64::new(0),
        })
    }

    pub(crate) fn status(&self) -> ConnStatus {
        match self.status.load(Ordering::Acquire) {
            0 => ConnStatus::Initialising,
            1 => ConnStatus::Idle,
            _ => ConnStatus::Acquired,
        }
    }

    pub(crate) fn set_status(&self, status: ConnStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Install the physical connection once dialing succeeds.
    pub(crate) fn install(&self, conn: Arc<dyn Connection>) {
        let _ = self.conn.set(conn);
    }

    /// The physical connection, absent only while initialising.
    pub(crate) fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.conn.get().cloned()
    }

    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() > self.max_age_at
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        let last_used = Duration::from_nanos(self.last_used_nanos.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last_used)
    }

    /// Mark the connection as used just now.
    pub(crate) fn touch(&self) {
        let nanos = u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_used_nanos.store(nanos, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ConnRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnRecord")
            .field("status", &self.status())
            .field("created_at", &self.created_at)
            .field("max_age_at", &self.max_age_at)
            .finish_non_exhaustive()
    }
}

/// A connection leased from the pool.
///
/// Dereferences to [`Connection`], so queries run directly on the guard.
/// Return it with [`Pool::release`]; a guard dropped without an explicit
/// release schedules the release in the background.
pub struct PoolConnection {
    record: Option<Arc<ConnRecord>>,
    conn: Arc<dyn Connection>,
    pool: Pool,
}

impl PoolConnection {
    pub(crate) fn new(record: Arc<ConnRecord>, conn: Arc<dyn Connection>, pool: Pool) -> Self {
        Self {
            record: Some(record),
            conn,
            pool,
        }
    }

    pub(crate) fn take_record(&mut self) -> Option<Arc<ConnRecord>> {
        self.record.take()
    }
}

impl Deref for PoolConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let ctx = CancellationToken::new();
            self.pool.release_record(&ctx, record);
        }
    }
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_starts_initialising_without_connection() {
        let record = ConnRecord::new(Duration::from_secs(3600), Duration::ZERO);
        assert_eq!(record.status(), ConnStatus::Initialising);
        assert!(record.connection().is_none());
        assert!(!record.is_expired());
    }

    #[test]
    fn test_record_expiry() {
        let record = ConnRecord::new(Duration::ZERO, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(record.is_expired());
    }

    #[test]
    fn test_touch_resets_idle_duration() {
        let record = ConnRecord::new(Duration::from_secs(3600), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(10));
        assert!(record.idle_duration() >= Duration::from_millis(10));
        record.touch();
        assert!(record.idle_duration() < Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_extends_age_deadline() {
        let base = ConnRecord::new(Duration::from_secs(10), Duration::ZERO);
        assert_eq!(base.max_age_at - base.created_at, Duration::from_secs(10));

        let jittered = ConnRecord::new(Duration::from_secs(10), Duration::from_secs(600));
        let lifetime = jittered.max_age_at - jittered.created_at;
        assert!(lifetime >= Duration::from_secs(10));
        assert!(lifetime < Duration::from_secs(610));
    }
}
