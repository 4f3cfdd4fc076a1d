//! Core pool state machine
//!
//! One mutex guards the registry of live records, the idle stack, and the
//! under-mutex acquire counters. A semaphore of `max_connections` permits
//! tracks the right to hold a slot: permits are taken before the mutex is
//! locked and released while it is held (the health checker's bulk
//! `try_acquire` is the one exception). The mutex is never held across an
//! `.await`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use tarn_rdbc::{Connection, Database};

use crate::connection::{ConnRecord, ConnStatus};
use crate::error::{Error, Result};
use crate::hooks::PoolHooks;
use crate::mvstack::MvStack;
use crate::stats::PoolMetrics;
use crate::util::WaitGroup;

/// Dials and tears down physical connections on behalf of the core,
/// running the configured hooks around the driver calls.
pub(crate) struct Dialer {
    db: Database,
    hooks: Arc<dyn PoolHooks>,
    metrics: Arc<PoolMetrics>,
}

impl Dialer {
    pub(crate) fn new(db: Database, hooks: Arc<dyn PoolHooks>, metrics: Arc<PoolMetrics>) -> Self {
        Self { db, hooks, metrics }
    }

    /// Dial a new physical connection: count it, copy the config through the
    /// `before_connect` hook, connect with the (possibly mutated) copy, and
    /// give `after_connect` a chance to reject the result.
    pub(crate) async fn construct(
        &self,
        ctx: &CancellationToken,
    ) -> tarn_rdbc::Result<Arc<dyn Connection>> {
        self.metrics.new_connections.fetch_add(1, Ordering::Relaxed);
        let mut config = self.db.config().clone();
        self.hooks.before_connect(ctx, &mut config).await?;
        let conn = self.db.connect_with(ctx, &config).await?;
        if let Err(error) = self.hooks.after_connect(ctx, conn.as_ref()).await {
            if let Err(close_error) = conn.close().await {
                tracing::debug!(error = %close_error, "closing rejected connection failed");
            }
            return Err(error);
        }
        Ok(conn)
    }

    /// Tear down a physical connection. Close failures are swallowed; the
    /// connection is gone either way.
    pub(crate) async fn destruct(&self, conn: Arc<dyn Connection>) {
        let ctx = CancellationToken::new();
        self.hooks.before_close(&ctx, conn.as_ref()).await;
        if let Err(error) = conn.close().await {
            tracing::debug!(error = %error, "closing pooled connection failed");
        }
    }
}

/// State guarded by the pool mutex.
pub(crate) struct PoolState {
    closed: bool,
    all: Vec<Arc<ConnRecord>>,
    idle: MvStack<Arc<ConnRecord>>,
    acquire_count: u64,
    acquire_duration: Duration,
    empty_acquire_count: u64,
}

/// Under-mutex statistics plus the live population counts, read together.
pub(crate) struct CoreSnapshot {
    pub(crate) acquire_count: u64,
    pub(crate) acquire_duration: Duration,
    pub(crate) empty_acquire_count: u64,
    pub(crate) total_connections: usize,
    pub(crate) idle_connections: usize,
}

pub(crate) struct PoolCore {
    sem: Semaphore,
    state: Mutex<PoolState>,
    destruct_wg: WaitGroup,
    max_size: usize,
    dialer: Dialer,
    metrics: Arc<PoolMetrics>,
    /// Cancelled when the pool closes; unblocks waiting acquires.
    base_acquire: CancellationToken,
}

impl PoolCore {
    pub(crate) fn new(
        max_connections: u32,
        dialer: Dialer,
        metrics: Arc<PoolMetrics>,
        base_acquire: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sem: Semaphore::new(max_connections as usize),
            state: Mutex::new(PoolState {
                closed: false,
                all: Vec::new(),
                idle: MvStack::new(),
                acquire_count: 0,
                acquire_duration: Duration::ZERO,
                empty_acquire_count: 0,
            }),
            destruct_wg: WaitGroup::new(),
            max_size: max_connections as usize,
            dialer,
            metrics,
            base_acquire,
        })
    }

    /// Register a fresh initialising record. Caller must hold the state lock
    /// and a semaphore permit for it.
    fn new_record(
        &self,
        state: &mut PoolState,
        max_lifetime: Duration,
        jitter: Duration,
    ) -> Arc<ConnRecord> {
        let record = ConnRecord::new(max_lifetime, jitter);
        state.all.push(Arc::clone(&record));
        self.destruct_wg.add(1);
        record
    }

    fn remove_record(all: &mut Vec<Arc<ConnRecord>>, record: &Arc<ConnRecord>) {
        if let Some(index) = all.iter().position(|r| Arc::ptr_eq(r, record)) {
            all.swap_remove(index);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn base_acquire_token(&self) -> &CancellationToken {
        &self.base_acquire
    }

    pub(crate) fn total_connections(&self) -> usize {
        self.state.lock().all.len()
    }

    pub(crate) fn snapshot(&self) -> CoreSnapshot {
        let state = self.state.lock();
        CoreSnapshot {
            acquire_count: state.acquire_count,
            acquire_duration: state.acquire_duration,
            empty_acquire_count: state.empty_acquire_count,
            total_connections: state.all.len(),
            idle_connections: state.idle.len(),
        }
    }

    /// Acquire one slot and produce an acquired record: either an idle record
    /// popped from the stack or a freshly dialed connection.
    pub(crate) async fn acquire_connection(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        max_lifetime: Duration,
        jitter: Duration,
    ) -> Result<Arc<ConnRecord>> {
        let started = Instant::now();

        let mut waited_for_permit = false;
        match self.sem.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => {
                waited_for_permit = true;
                tokio::select! {
                    _ = ctx.cancelled() => {
                        self.metrics.canceled_acquires.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::Canceled);
                    }
                    _ = self.base_acquire.cancelled() => return Err(Error::Closed),
                    permit = self.sem.acquire() => match permit {
                        Ok(permit) => permit.forget(),
                        Err(_) => return Err(Error::Closed),
                    },
                }
            }
        }

        let record = {
            let mut state = self.state.lock();
            if state.closed {
                self.sem.add_permits(1);
                return Err(Error::Closed);
            }
            if let Some(record) = state.idle.pop() {
                record.set_status(ConnStatus::Acquired);
                if waited_for_permit {
                    state.empty_acquire_count += 1;
                }
                state.acquire_count += 1;
                state.acquire_duration += started.elapsed();
                return Ok(record);
            }
            self.new_record(&mut state, max_lifetime, jitter)
        };

        let record = self.initialise_acquired(ctx, record).await?;

        let mut state = self.state.lock();
        state.empty_acquire_count += 1;
        state.acquire_count += 1;
        state.acquire_duration += started.elapsed();
        Ok(record)
    }

    /// Race the driver dial against the caller's cancellation.
    ///
    /// If the caller gives up while the dial is still in flight, the dial
    /// task finishes on its own and parks the built connection in the idle
    /// stack instead of leaking it.
    async fn initialise_acquired(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        record: Arc<ConnRecord>,
    ) -> Result<Arc<ConnRecord>> {
        let (result_tx, result_rx) = oneshot::channel::<Result<()>>();
        let core = Arc::clone(self);
        let task_ctx = ctx.clone();
        let task_record = Arc::clone(&record);
        tokio::spawn(async move {
            match core.dialer.construct(&task_ctx).await {
                Err(error) => {
                    {
                        let mut state = core.state.lock();
                        Self::remove_record(&mut state.all, &task_record);
                        core.sem.add_permits(1);
                    }
                    core.destruct_wg.done();
                    if !task_ctx.is_cancelled() {
                        let _ = result_tx.send(Err(error.into()));
                    }
                }
                Ok(conn) => {
                    {
                        let _state = core.state.lock();
                        task_record.install(conn);
                        task_record.set_status(ConnStatus::Acquired);
                    }
                    if task_ctx.is_cancelled() || result_tx.send(Ok(())).is_err() {
                        // The caller is gone; keep the connection.
                        core.release_unused(task_record);
                    }
                }
            }
        });

        // Biased: once the dial task has sent a result, that result must win
        // over a racing cancellation, because a sent success means the record
        // is ours to return.
        tokio::select! {
            biased;
            result = result_rx => match result {
                Ok(Ok(())) => Ok(record),
                Ok(Err(error)) => Err(error),
                Err(_) => {
                    self.metrics.canceled_acquires.fetch_add(1, Ordering::Relaxed);
                    Err(Error::Canceled)
                }
            },
            _ = ctx.cancelled() => {
                self.metrics.canceled_acquires.fetch_add(1, Ordering::Relaxed);
                Err(Error::Canceled)
            }
        }
    }

    /// Return a record to the pool, stamping it as used just now.
    pub(crate) fn release(self: &Arc<Self>, record: Arc<ConnRecord>) {
        record.touch();
        self.release_inner(record);
    }

    /// Return a record to the pool without touching its last-used timestamp.
    /// Used when the record was taken but never handed to a caller.
    pub(crate) fn release_unused(self: &Arc<Self>, record: Arc<ConnRecord>) {
        self.release_inner(record);
    }

    fn release_inner(self: &Arc<Self>, record: Arc<ConnRecord>) {
        let mut state = self.state.lock();
        self.sem.add_permits(1);
        if state.closed {
            Self::remove_record(&mut state.all, &record);
            drop(state);
            let core = Arc::clone(self);
            tokio::spawn(async move {
                core.destroy_connection(record).await;
            });
        } else {
            record.set_status(ConnStatus::Idle);
            state.idle.push(record);
        }
    }

    /// Tear down a record that holds no semaphore permit (idle records
    /// drained at close, or post-close releases).
    pub(crate) async fn destroy_connection(&self, record: Arc<ConnRecord>) {
        if let Some(conn) = record.connection() {
            self.dialer.destruct(conn).await;
        }
        self.destruct_wg.done();
        tracing::trace!("destroyed pooled connection");
    }

    /// Tear down an acquired record: destroy the connection, then drop it
    /// from the registry and give its permit back.
    pub(crate) async fn destroy_acquired_connection(self: &Arc<Self>, record: Arc<ConnRecord>) {
        self.destroy_connection(Arc::clone(&record)).await;
        let mut state = self.state.lock();
        Self::remove_record(&mut state.all, &record);
        self.sem.add_permits(1);
    }

    pub(crate) fn spawn_destroy_acquired(self: &Arc<Self>, record: Arc<ConnRecord>) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.destroy_acquired_connection(record).await;
        });
    }

    /// Grab as many permits as are free without blocking: the whole count if
    /// possible, otherwise exponentially descending chunks. Never starves a
    /// blocked caller, since it refuses to wait.
    fn try_acquire_permits(&self, want: usize) -> usize {
        if let Ok(permit) = self.sem.try_acquire_many(want as u32) {
            permit.forget();
            return want;
        }
        let mut granted = 0;
        for bit in (0..=want.ilog2()).rev() {
            let chunk = 1usize << bit;
            if let Ok(permit) = self.sem.try_acquire_many(chunk as u32) {
                permit.forget();
                granted += chunk;
            }
        }
        granted
    }

    /// Take as many idle records as free capacity allows, flip them to
    /// acquired, and seal a generation boundary so records this sweep could
    /// not examine are handed out before any it pushes back.
    pub(crate) fn acquire_all_idle(&self) -> Vec<Arc<ConnRecord>> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        let idle_count = state.idle.len();
        if idle_count == 0 {
            return Vec::new();
        }

        let granted = self.try_acquire_permits(idle_count);
        let take = granted.min(idle_count);
        if granted > take {
            self.sem.add_permits(granted - take);
        }

        let mut acquired = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(record) = state.idle.pop() {
                record.set_status(ConnStatus::Acquired);
                acquired.push(record);
            }
        }

        state.idle.bump();
        acquired
    }

    /// Dial a connection straight into the idle stack, without blocking on
    /// capacity. Used by warmup and the health checker's top-up.
    pub(crate) async fn create_connection(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        max_lifetime: Duration,
        jitter: Duration,
    ) -> Result<()> {
        match self.sem.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(Error::SpaceNotAvailable),
        }

        let record = {
            let mut state = self.state.lock();
            if state.closed {
                self.sem.add_permits(1);
                return Err(Error::Closed);
            }
            if state.all.len() >= self.max_size {
                self.sem.add_permits(1);
                return Err(Error::SpaceNotAvailable);
            }
            self.new_record(&mut state, max_lifetime, jitter)
        };

        match self.dialer.construct(ctx).await {
            Err(error) => {
                {
                    let mut state = self.state.lock();
                    Self::remove_record(&mut state.all, &record);
                    self.sem.add_permits(1);
                }
                self.destruct_wg.done();
                Err(error.into())
            }
            Ok(conn) => {
                let closed_during_dial = {
                    let mut state = self.state.lock();
                    record.install(conn);
                    self.sem.add_permits(1);
                    if state.closed {
                        Self::remove_record(&mut state.all, &record);
                        true
                    } else {
                        record.set_status(ConnStatus::Idle);
                        state.idle.push(Arc::clone(&record));
                        false
                    }
                };
                if closed_during_dial {
                    self.destroy_connection(record).await;
                    return Err(Error::Closed);
                }
                Ok(())
            }
        }
    }

    /// Close the pool: reject future acquires, wake blocked ones, drain the
    /// idle stack into background destroys, and wait until every record the
    /// pool ever created has been destroyed. Acquired records are not yanked
    /// from their holders; their release finishes the drain.
    pub(crate) async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if !state.closed {
                state.closed = true;
                self.base_acquire.cancel();
                while let Some(record) = state.idle.pop() {
                    Self::remove_record(&mut state.all, &record);
                    let core = Arc::clone(self);
                    tokio::spawn(async move {
                        core.destroy_connection(record).await;
                    });
                }
            }
        }
        self.destruct_wg.wait().await;
    }
}
