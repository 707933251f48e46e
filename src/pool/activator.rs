//! Background tunnel activation
//!
//! Two pieces: a manager task that walks the cache and claims closed
//! records for opening (respecting a concurrency budget), and a per-record
//! worker task that performs the actual open with bounded exponential
//! backoff. The manager exits once a pass spends its whole budget — from
//! then on, replacement opens come from the reconnect loop and `add`.
//!
//! Workers observe cancellation cooperatively: before and after every open
//! attempt they sample the record state, and if an external caller has
//! moved it out of `Opening` (to `Closing` or `Deleting`) they perform the
//! corresponding teardown instead of installing the result.

use std::sync::Arc;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::record::{TunnelRef, TunnelState};
use super::TunnelPool;

/// Spawn the activation manager
pub(crate) fn spawn_manager(pool: TunnelPool) {
    tokio::spawn(async move {
        run_manager(pool).await;
    });
}

/// Spawn a worker that opens one record
pub(crate) fn spawn_worker(pool: TunnelPool, record: TunnelRef) {
    tokio::spawn(async move {
        run_worker(pool, record).await;
    });
}

/// Activation manager loop
///
/// Each pass claims up to `max_active - |active| + 1` closed cache records
/// and hands them to workers. If a pass spends the whole budget there is
/// more supply than budget, so the manager retires and leaves further opens
/// to the reconnect path; otherwise it sleeps a long, jittered interval and
/// tries again until enough tunnels are active.
async fn run_manager(pool: TunnelPool) {
    loop {
        let (claimed, budget, jitter_ms) = {
            let mut state = pool.state().lock();
            let budget = pool.config().max_active.saturating_sub(state.active.len()) + 1;

            let mut claimed = Vec::new();
            for i in 0..state.cache.len() {
                if claimed.len() >= budget {
                    break;
                }
                let record = Arc::clone(state.cache.get(i));
                if record.state() == TunnelState::Closed {
                    record.set_state(TunnelState::Opening);
                    claimed.push(record);
                }
            }

            let jitter_ms = state.rng.gen::<u64>() % pool.config().activation_jitter_ms.max(1);
            (claimed, budget, jitter_ms)
        };

        let exhausted = claimed.len() == budget;
        for record in claimed {
            spawn_worker(pool.clone(), record);
        }

        if exhausted {
            // Plenty of candidates in flight; further opens follow
            // reconnection.
            break;
        }

        sleep(pool.config().activation_interval() + Duration::from_millis(jitter_ms)).await;

        if pool.state().lock().active.len() >= pool.config().max_active {
            break;
        }
    }

    debug!("activation manager finished");
}

/// Open one record and install the outcome.
pub(crate) async fn run_worker(pool: TunnelPool, record: TunnelRef) {
    let opened = try_open(&pool, &record).await;

    let mut stale_handle = None;
    {
        let mut state = pool.state().lock();
        let mut inner = record.lock();
        match inner.state {
            TunnelState::Deleting => {
                // The record was retired mid-open; this worker is its owner
                // of last resort.
                stale_handle = inner.handle.take();
                debug!(url = %record.url(), "dropping tunnel deleted while opening");
            }
            TunnelState::Closing => {
                stale_handle = inner.handle.take();
                inner.state = TunnelState::Closed;
                debug!(url = %record.url(), "closed tunnel while opening");
            }
            TunnelState::Opening => {
                if opened {
                    info!(url = %record.url(), "opened tunnel");
                    inner.state = TunnelState::Open;
                    inner.age = pool.config().init_age;
                    drop(inner);
                    state.active.insert(Arc::clone(&record));
                } else {
                    warn!(url = %record.url(), "unable to open tunnel; giving up");
                    inner.state = TunnelState::Dead;
                    inner.age = inner.age.saturating_sub(1);
                }
            }
            other => unreachable!(
                "tunnel {} in state {} after open attempt",
                record.url(),
                other
            ),
        }
    }

    if let Some(handle) = stale_handle {
        handle.close().await;
    }

    pool.write_cache_file();
}

/// Bounded-backoff open loop.
///
/// Returns `true` when a transport handle was installed on the record, or
/// when the loop stopped because the record left `Opening` (the caller's
/// state dispatch handles those). Returns `false` only when every attempt
/// failed.
pub(crate) async fn try_open(pool: &TunnelPool, record: &TunnelRef) -> bool {
    let stagger_ms = {
        let mut state = pool.state().lock();
        state.rng.gen::<u64>() % pool.config().open_retry_jitter_ms.max(1)
    };

    let mut retry_delay = pool.config().open_retry_base() + Duration::from_millis(stagger_ms);
    let mut retries = pool.config().open_retries;

    while record.state() == TunnelState::Opening {
        debug!(url = %record.url(), "attempting to open tunnel");
        match pool.transport().open(record.url()).await {
            Ok(handle) => {
                record.lock().handle = Some(handle);
                return true;
            }
            Err(err) => {
                if record.state() != TunnelState::Opening {
                    break;
                }
                retries -= 1;
                if retries == 0 {
                    return false;
                }
                warn!(
                    url = %record.url(),
                    error = %err,
                    "unable to open tunnel; retrying in {:.1}s",
                    retry_delay.as_secs_f64()
                );
                sleep(retry_delay).await;
                retry_delay *= pool.config().open_backoff_multiplier;
            }
        }
    }

    true
}
