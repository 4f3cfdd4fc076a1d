//! The pool façade
//!
//! [`Pool`] is the public entry point: it owns the configuration, hooks, and
//! statistics, and delegates slot accounting to the core. Cloning a `Pool` is
//! cheap; clones share the same underlying pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::connection::{ConnRecord, ConnStatus, PoolConnection};
use crate::core::{Dialer, PoolCore};
use crate::error::{Error, Result};
use crate::health;
use crate::hooks::{NoopHooks, PoolHooks};
use crate::stats::{PoolMetrics, PoolStats};

/// Idle connections older than this are pinged before handout.
const PING_IDLE_THRESHOLD: Duration = Duration::from_secs(1);
/// Delay before a release-triggered health-check kick fires.
const HEALTH_KICK_DELAY: Duration = Duration::from_millis(500);

/// A bounded pool of database connections.
///
/// Connections are dialed through the driver registered for the configured
/// driver name, kept warm up to the configured minimum, and recycled on
/// lifetime and idleness thresholds by a background health checker.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) core: Arc<PoolCore>,
    pub(crate) hooks: Arc<dyn PoolHooks>,
    pub(crate) metrics: Arc<PoolMetrics>,
    pub(crate) health_tx: mpsc::Sender<()>,
    pub(crate) close_token: CancellationToken,
    close_latched: AtomicBool,
    pub(crate) min_connections: u32,
    pub(crate) max_connections: u32,
    pub(crate) max_connection_lifetime: Duration,
    pub(crate) max_connection_lifetime_jitter: Duration,
    pub(crate) max_connection_idle_time: Duration,
    pub(crate) health_check_period: Duration,
}

impl PoolInner {
    /// Nudge the health checker soon, without blocking and without piling up
    /// kicks: the channel holds at most one pending trigger.
    pub(crate) fn force_trigger_health_check(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(HEALTH_KICK_DELAY).await;
            let _ = inner.health_tx.try_send(());
        });
    }
}

impl Pool {
    /// Validate the configuration, resolve its driver, and start the pool.
    ///
    /// The warmup/health-check task is spawned immediately; `min_connections`
    /// idle connections come up in the background. The given token scopes the
    /// pool's own background dials and is also cancelled when the pool closes.
    pub async fn new(ctx: &CancellationToken, mut config: PoolConfig) -> Result<Pool> {
        config.validate_and_default()?;
        let db = tarn_rdbc::open(config.connection.clone())?;
        let hooks: Arc<dyn PoolHooks> = config
            .hooks
            .clone()
            .unwrap_or_else(|| Arc::new(NoopHooks));
        let metrics = Arc::new(PoolMetrics::default());

        let dialer = Dialer::new(db, Arc::clone(&hooks), Arc::clone(&metrics));
        let core = PoolCore::new(
            config.max_connections,
            dialer,
            Arc::clone(&metrics),
            ctx.child_token(),
        );

        let (health_tx, health_rx) = mpsc::channel(1);
        let inner = Arc::new(PoolInner {
            core,
            hooks,
            metrics,
            health_tx,
            close_token: CancellationToken::new(),
            close_latched: AtomicBool::new(false),
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            max_connection_lifetime: config.max_connection_lifetime,
            max_connection_lifetime_jitter: config.max_connection_lifetime_jitter,
            max_connection_idle_time: config.max_connection_idle_time,
            health_check_period: config.health_check_period,
        });

        tokio::spawn(health::warmup(Arc::clone(&inner), health_rx));

        tracing::debug!(
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            "connection pool created"
        );
        Ok(Pool { inner })
    }

    /// Lease a connection from the pool.
    ///
    /// Retries internally when a connection fails its liveness ping or is
    /// vetoed by the `before_acquire` hook; returns on success, on
    /// cancellation of `ctx`, on pool close, or on a dial error.
    pub async fn acquire(&self, ctx: &CancellationToken) -> Result<PoolConnection> {
        loop {
            if ctx.is_cancelled() {
                self.inner
                    .metrics
                    .canceled_acquires
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::Canceled);
            }

            let record = self
                .inner
                .core
                .acquire_connection(
                    ctx,
                    self.inner.max_connection_lifetime,
                    self.inner.max_connection_lifetime_jitter,
                )
                .await?;

            let Some(conn) = record.connection() else {
                self.inner.core.spawn_destroy_acquired(record);
                continue;
            };

            if record.idle_duration() > PING_IDLE_THRESHOLD {
                if let Err(error) = conn.ping().await {
                    tracing::debug!(error = %error, "discarding idle connection that failed ping");
                    self.inner.core.spawn_destroy_acquired(record);
                    continue;
                }
            }

            if self.inner.hooks.before_acquire(ctx, conn.as_ref()).await {
                return Ok(PoolConnection::new(record, conn, self.clone()));
            }
            self.inner.core.spawn_destroy_acquired(record);
        }
    }

    /// Return a leased connection to the pool.
    ///
    /// Expired connections are destroyed instead of re-pooled; otherwise the
    /// `after_release` hook decides, in a background task, whether the
    /// connection goes back on the idle stack.
    pub fn release(&self, ctx: &CancellationToken, mut conn: PoolConnection) {
        if let Some(record) = conn.take_record() {
            self.release_record(ctx, record);
        }
    }

    pub(crate) fn release_record(&self, ctx: &CancellationToken, record: Arc<ConnRecord>) {
        if record.status() != ConnStatus::Acquired {
            return;
        }
        if record.is_expired() {
            self.inner
                .metrics
                .lifetime_destroys
                .fetch_add(1, Ordering::Relaxed);
            self.inner.core.spawn_destroy_acquired(record);
            self.inner.force_trigger_health_check();
            return;
        }

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let keep = match record.connection() {
                Some(conn) => inner.hooks.after_release(&ctx, conn.as_ref()).await,
                None => false,
            };
            if keep {
                inner.core.release(record);
            } else {
                inner
                    .metrics
                    .lifetime_destroys
                    .fetch_add(1, Ordering::Relaxed);
                inner.core.destroy_acquired_connection(record).await;
                inner.force_trigger_health_check();
            }
        });
    }

    /// Close the pool and block until every connection it created has been
    /// destroyed. Idempotent; later calls return immediately. Connections
    /// currently leased out are destroyed as their holders release them.
    pub async fn close(&self) {
        if self.inner.close_latched.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.close_token.cancel();
        self.inner.core.close().await;
        tracing::debug!("connection pool closed");
    }

    /// Whether [`Pool::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.core.is_closed()
    }

    /// A point-in-time snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let snapshot = self.inner.core.snapshot();
        PoolStats {
            new_connections_count: self.inner.metrics.new_connections.load(Ordering::Relaxed),
            lifetime_destroy_count: self.inner.metrics.lifetime_destroys.load(Ordering::Relaxed),
            idle_destroy_count: self.inner.metrics.idle_destroys.load(Ordering::Relaxed),
            canceled_acquire_count: self.inner.metrics.canceled_acquires.load(Ordering::Relaxed),
            acquire_count: snapshot.acquire_count,
            acquire_duration: snapshot.acquire_duration,
            empty_acquire_count: snapshot.empty_acquire_count,
            total_connections: snapshot.total_connections,
            idle_connections: snapshot.idle_connections,
            max_connections: self.inner.max_connections,
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_connections", &self.inner.max_connections)
            .field("min_connections", &self.inner.min_connections)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
