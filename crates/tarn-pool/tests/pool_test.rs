//! End-to-end pool behaviour against a stub driver

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tarn_pool::{Error, Pool, PoolConfig, PoolHooks};
use tarn_rdbc::{
    register_driver, Connection, ConnectionConfig, Connector, Driver, PreparedStatement, Row,
    Transaction, Value,
};

// ==================== Stub driver ====================

#[derive(Default)]
struct StubState {
    connects: AtomicU64,
    closes: AtomicU64,
    pings: AtomicU64,
    /// Number of upcoming dials that should fail
    connect_failures: AtomicU64,
    /// Whether pings should currently fail
    ping_failures: AtomicBool,
}

struct StubDriver {
    name: String,
    state: Arc<StubState>,
    connect_delay: Duration,
}

impl Driver for StubDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector(&self, _config: &ConnectionConfig) -> tarn_rdbc::Result<Arc<dyn Connector>> {
        Ok(Arc::new(StubConnector {
            state: Arc::clone(&self.state),
            connect_delay: self.connect_delay,
        }))
    }
}

struct StubConnector {
    state: Arc<StubState>,
    connect_delay: Duration,
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(
        &self,
        _ctx: &CancellationToken,
        _config: &ConnectionConfig,
    ) -> tarn_rdbc::Result<Arc<dyn Connection>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let failures = self.state.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state
                .connect_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(tarn_rdbc::Error::connection("stub dial refused"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubConn {
            state: Arc::clone(&self.state),
        }))
    }
}

struct StubConn {
    state: Arc<StubState>,
}

#[async_trait]
impl Connection for StubConn {
    async fn query(&self, _sql: &str, _params: &[Value]) -> tarn_rdbc::Result<Vec<Row>> {
        Ok(Vec::new())
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> tarn_rdbc::Result<u64> {
        Ok(0)
    }

    async fn prepare(&self, _sql: &str) -> tarn_rdbc::Result<Box<dyn PreparedStatement>> {
        Err(tarn_rdbc::Error::unsupported("stub does not prepare"))
    }

    async fn begin(&self) -> tarn_rdbc::Result<Box<dyn Transaction>> {
        Err(tarn_rdbc::Error::unsupported("stub does not begin"))
    }

    async fn ping(&self) -> tarn_rdbc::Result<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.ping_failures.load(Ordering::SeqCst) {
            return Err(tarn_rdbc::Error::connection("stub ping failed"));
        }
        Ok(())
    }

    async fn close(&self) -> tarn_rdbc::Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ==================== Helpers ====================

/// Register a stub driver under a test-unique name and return its state plus
/// a pool config pointing at it.
fn stub(name: &str, connect_delay: Duration) -> (Arc<StubState>, PoolConfig) {
    let state = Arc::new(StubState::default());
    register_driver(Arc::new(StubDriver {
        name: name.to_string(),
        state: Arc::clone(&state),
        connect_delay,
    }))
    .expect("driver name must be unique per test");
    let config = PoolConfig::new(ConnectionConfig::new(name, format!("stub://{name}")));
    (state, config)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(3);
    let start = tokio::time::Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn cancel_after(ctx: &CancellationToken, delay: Duration) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        ctx.cancel();
    });
}

// ==================== Scenarios ====================

#[tokio::test]
async fn acquire_release_reuses_the_connection() {
    let (state, config) = stub("stub-basic", Duration::ZERO);
    let ctx = CancellationToken::new();
    let pool = Pool::new(&ctx, config.with_max_connections(1)).await.unwrap();

    let conn = pool.acquire(&ctx).await.unwrap();
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);
    assert!(conn.query("SELECT 1", &[]).await.unwrap().is_empty());

    pool.release(&ctx, conn);
    wait_until("connection back in the pool", || {
        pool.stats().idle_connections == 1
    })
    .await;

    let conn = pool.acquire(&ctx).await.unwrap();
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.new_connections_count, 1);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.acquire_count, 2);
    assert_eq!(stats.empty_acquire_count, 1);

    drop(conn);
    pool.close().await;
    assert_eq!(state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acquire_times_out_when_pool_is_full() {
    let (_state, config) = stub("stub-capacity", Duration::ZERO);
    let root = CancellationToken::new();
    let pool = Pool::new(&root, config.with_max_connections(1)).await.unwrap();

    let held = pool.acquire(&root).await.unwrap();

    let deadline = CancellationToken::new();
    cancel_after(&deadline, Duration::from_millis(100));
    let err = pool.acquire(&deadline).await.unwrap_err();
    assert!(matches!(err, Error::Canceled));

    let stats = pool.stats();
    assert_eq!(stats.canceled_acquire_count, 1);
    assert_eq!(stats.total_connections, 1);

    drop(held);
    pool.close().await;
}

#[tokio::test]
async fn expired_connections_are_replaced() {
    let (state, config) = stub("stub-lifetime", Duration::ZERO);
    let ctx = CancellationToken::new();
    let pool = Pool::new(
        &ctx,
        config
            .with_max_connections(2)
            .with_max_connection_lifetime(Duration::from_millis(50))
            .with_health_check_period(Duration::from_millis(50)),
    )
    .await
    .unwrap();

    let conn = pool.acquire(&ctx).await.unwrap();
    pool.release(&ctx, conn);
    wait_until("connection back in the pool", || {
        pool.stats().idle_connections == 1
    })
    .await;

    wait_until("health checker prunes the expired connection", || {
        pool.stats().lifetime_destroy_count >= 1
    })
    .await;
    wait_until("pruned connection is closed", || {
        state.closes.load(Ordering::SeqCst) >= 1
    })
    .await;

    let conn = pool.acquire(&ctx).await.unwrap();
    let stats = pool.stats();
    assert!(stats.new_connections_count >= 2);

    drop(conn);
    pool.close().await;
}

#[tokio::test]
async fn idle_reaping_respects_minimum() {
    let (state, config) = stub("stub-idle", Duration::ZERO);
    let ctx = CancellationToken::new();
    let pool = Pool::new(
        &ctx,
        config
            .with_min_connections(2)
            .with_max_connections(5)
            .with_max_connection_idle_time(Duration::from_millis(150))
            .with_health_check_period(Duration::from_millis(100)),
    )
    .await
    .unwrap();

    wait_until("warmup reaches the minimum", || {
        pool.stats().idle_connections == 2
    })
    .await;

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire(&ctx).await.unwrap());
    }
    assert_eq!(pool.stats().total_connections, 5);
    for conn in held {
        pool.release(&ctx, conn);
    }
    wait_until("all five are idle", || pool.stats().idle_connections == 5).await;

    wait_until("idle reaping prunes down to the minimum", || {
        pool.stats().idle_destroy_count == 3
    })
    .await;
    wait_until("population settles at the minimum", || {
        let stats = pool.stats();
        stats.idle_connections == 2 && stats.total_connections == 2
    })
    .await;
    wait_until("pruned connections are closed", || {
        state.closes.load(Ordering::SeqCst) == 3
    })
    .await;

    pool.close().await;
}

#[tokio::test]
async fn canceled_dial_lands_in_the_pool() {
    let (state, config) = stub("stub-cancel", Duration::from_millis(200));
    let root = CancellationToken::new();
    let pool = Pool::new(&root, config.with_max_connections(1)).await.unwrap();

    let deadline = CancellationToken::new();
    cancel_after(&deadline, Duration::from_millis(50));
    let err = pool.acquire(&deadline).await.unwrap_err();
    assert!(matches!(err, Error::Canceled));
    assert_eq!(pool.stats().canceled_acquire_count, 1);

    // The dial keeps going after the caller gave up; the finished connection
    // must land in the idle stack, not leak.
    wait_until("abandoned dial lands in the pool", || {
        pool.stats().idle_connections == 1
    })
    .await;
    let stats = pool.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);

    let conn = pool.acquire(&root).await.unwrap();
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);

    drop(conn);
    pool.close().await;
    assert_eq!(state.closes.load(Ordering::SeqCst), 1);
}

struct VetoFirst {
    vetoed: AtomicBool,
}

#[async_trait]
impl PoolHooks for VetoFirst {
    async fn before_acquire(&self, _ctx: &CancellationToken, _conn: &dyn Connection) -> bool {
        self.vetoed.swap(true, Ordering::SeqCst)
    }
}

#[tokio::test]
async fn before_acquire_veto_destroys_and_retries() {
    let (state, config) = stub("stub-veto", Duration::ZERO);
    let ctx = CancellationToken::new();
    let pool = Pool::new(
        &ctx,
        config
            .with_max_connections(2)
            .with_hooks(Arc::new(VetoFirst {
                vetoed: AtomicBool::new(false),
            })),
    )
    .await
    .unwrap();

    let conn = pool.acquire(&ctx).await.unwrap();
    assert_eq!(pool.stats().new_connections_count, 2);
    wait_until("vetoed connection is destroyed", || {
        state.closes.load(Ordering::SeqCst) == 1
    })
    .await;

    drop(conn);
    pool.close().await;
    assert_eq!(state.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn warmup_reaches_minimum() {
    let (state, config) = stub("stub-warmup", Duration::ZERO);
    let ctx = CancellationToken::new();
    let pool = Pool::new(
        &ctx,
        config.with_min_connections(3).with_max_connections(5),
    )
    .await
    .unwrap();

    wait_until("warmup reaches the minimum", || {
        pool.stats().idle_connections == 3
    })
    .await;
    assert_eq!(pool.stats().total_connections, 3);
    assert_eq!(state.connects.load(Ordering::SeqCst), 3);

    pool.close().await;
    assert_eq!(state.closes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn close_destroys_idle_and_rejects_acquire() {
    let (state, config) = stub("stub-close", Duration::ZERO);
    let ctx = CancellationToken::new();
    let pool = Pool::new(&ctx, config.with_max_connections(2)).await.unwrap();

    let a = pool.acquire(&ctx).await.unwrap();
    let b = pool.acquire(&ctx).await.unwrap();
    pool.release(&ctx, a);
    pool.release(&ctx, b);
    wait_until("both connections are idle", || {
        pool.stats().idle_connections == 2
    })
    .await;

    pool.close().await;
    pool.close().await;
    assert!(pool.is_closed());
    assert_eq!(state.closes.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().total_connections, 0);

    let err = pool.acquire(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
}

#[tokio::test]
async fn dial_failure_surfaces_to_acquire() {
    let (state, config) = stub("stub-dialfail", Duration::ZERO);
    state.connect_failures.store(1, Ordering::SeqCst);
    let ctx = CancellationToken::new();
    let pool = Pool::new(&ctx, config.with_max_connections(1)).await.unwrap();

    let err = pool.acquire(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::Rdbc(_)));
    assert_eq!(pool.stats().total_connections, 0);

    let conn = pool.acquire(&ctx).await.unwrap();
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().new_connections_count, 2);

    drop(conn);
    pool.close().await;
}

#[tokio::test]
async fn failed_ping_discards_the_idle_connection() {
    let (state, config) = stub("stub-ping", Duration::ZERO);
    let ctx = CancellationToken::new();
    let pool = Pool::new(&ctx, config.with_max_connections(2)).await.unwrap();

    let conn = pool.acquire(&ctx).await.unwrap();
    pool.release(&ctx, conn);
    wait_until("connection back in the pool", || {
        pool.stats().idle_connections == 1
    })
    .await;

    // Connections idle for more than a second get pinged on handout.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    state.ping_failures.store(true, Ordering::SeqCst);

    let conn = pool.acquire(&ctx).await.unwrap();
    assert_eq!(state.pings.load(Ordering::SeqCst), 1);
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);

    state.ping_failures.store(false, Ordering::SeqCst);
    drop(conn);
    pool.close().await;
}
