//! Warmup and the background health-check loop
//!
//! One task per pool: it pre-fills to the configured minimum, then loops on a
//! ticker, an explicit kick channel, and the close signal. Each sweep tops the
//! pool up to the minimum, prunes expired and idle-too-long connections, and
//! re-checks after a short pause for as long as it keeps destroying.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::pool::PoolInner;

const RECHECK_PAUSE: Duration = Duration::from_millis(500);

pub(crate) async fn warmup(inner: Arc<PoolInner>, kick: mpsc::Receiver<()>) {
    if let Err(error) = create_idle_connections(&inner, i64::from(inner.min_connections)).await {
        tracing::debug!(error = %error, "pool warmup incomplete");
    }
    health_checker(inner, kick).await;
}

async fn health_checker(inner: Arc<PoolInner>, mut kick: mpsc::Receiver<()>) {
    let period = inner.health_check_period;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = inner.close_token.cancelled() => return,
            _ = kick.recv() => check_health(&inner).await,
            _ = ticker.tick() => check_health(&inner).await,
        }
    }
}

async fn check_health(inner: &Arc<PoolInner>) {
    loop {
        let deficit =
            i64::from(inner.min_connections) - inner.core.total_connections() as i64;
        if create_idle_connections(inner, deficit).await.is_err() {
            break;
        }
        if !handle_expiry_idleness(inner) {
            break;
        }
        // Something was pruned; pause so replacements can come up, then look
        // again until the population is stable.
        tokio::select! {
            _ = inner.close_token.cancelled() => return,
            _ = tokio::time::sleep(RECHECK_PAUSE) => {}
        }
    }
}

/// Dial `count` idle connections concurrently. The first real error cancels
/// the rest and is returned; losing the capacity race is not an error here.
async fn create_idle_connections(inner: &Arc<PoolInner>, count: i64) -> Result<()> {
    if count <= 0 {
        return Ok(());
    }

    let cancel_rest = inner.core.base_acquire_token().child_token();
    let mut dials = JoinSet::new();
    for _ in 0..count {
        let core = Arc::clone(&inner.core);
        let ctx = cancel_rest.clone();
        let max_lifetime = inner.max_connection_lifetime;
        let jitter = inner.max_connection_lifetime_jitter;
        dials.spawn(async move {
            match core.create_connection(&ctx, max_lifetime, jitter).await {
                Err(Error::SpaceNotAvailable) => Ok(()),
                result => result,
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = dials.join_next().await {
        if let Ok(Err(error)) = joined {
            if first_error.is_none() {
                cancel_rest.cancel();
                first_error = Some(error);
            }
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Sweep the idle set once. Returns whether anything was destroyed.
fn handle_expiry_idleness(inner: &Arc<PoolInner>) -> bool {
    let min = i64::from(inner.min_connections);
    let mut total = inner.core.total_connections() as i64;
    let mut destroyed = false;

    for record in inner.core.acquire_all_idle() {
        if record.is_expired() && total >= min {
            inner.metrics.lifetime_destroys.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("pruning connection past its age deadline");
            inner.core.spawn_destroy_acquired(record);
            total -= 1;
            destroyed = true;
        } else if record.idle_duration() > inner.max_connection_idle_time && total > min {
            inner.metrics.idle_destroys.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("pruning connection idle past the threshold");
            inner.core.spawn_destroy_acquired(record);
            total -= 1;
            destroyed = true;
        } else {
            inner.core.release_unused(record);
        }
    }

    destroyed
}
