//! Background tunnel reconnection
//!
//! The manager is a plain poll loop: every second (plus jitter) it asks
//! each active tunnel's transport whether the tunnel has expired, flags the
//! expired ones so they are only handled once, and spawns a worker per
//! flagged URL. Anything cleverer would be a lot of machinery for a loop
//! that burns no measurable CPU at the target tunnel count.
//!
//! A worker does not reopen the old record in place. It builds a fresh
//! record (new instance id) for the same URL, opens it with the shared
//! bounded-backoff procedure, and swaps it into whichever sets still hold
//! that URL. The new id is what lets the selector's history keep blaming
//! the dead instance without touching its replacement.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::activator::try_open;
use super::record::TunnelState;
use super::TunnelPool;

/// Spawn the reconnect manager
pub(crate) fn spawn_manager(pool: TunnelPool) {
    tokio::spawn(async move {
        run_manager(pool).await;
    });
}

/// Expiry poll loop; runs for the life of the pool.
async fn run_manager(pool: TunnelPool) {
    loop {
        let jitter_ms = {
            let mut state = pool.state().lock();
            state.rng.gen::<u64>() % pool.config().reconnect_jitter_ms.max(1)
        };
        sleep(pool.config().reconnect_poll() + Duration::from_millis(jitter_ms)).await;

        let expired: Vec<String> = {
            let state = pool.state().lock();
            let now = Instant::now();
            let mut urls = Vec::new();
            for record in state.active.iter() {
                let mut inner = record.lock();
                // The reconnect flag ensures one replacement attempt at a
                // time per record.
                if inner.reconnect {
                    continue;
                }
                let expired = inner.handle.as_ref().is_some_and(|h| h.is_expired(now));
                if expired {
                    inner.reconnect = true;
                    urls.push(record.url().to_string());
                }
            }
            urls
        };

        for url in expired {
            debug!(url = %url, "tunnel expired; reconnecting");
            let pool = pool.clone();
            tokio::spawn(async move {
                run_worker(pool, url).await;
            });
        }
    }
}

/// Replace one expired tunnel.
///
/// The worker owns `url` for its whole lifetime; both the success and the
/// failure branch address the old record through it.
async fn run_worker(pool: TunnelPool, url: String) {
    let record = pool.new_record(&url, pool.config().init_age);
    record.set_state(TunnelState::Opening);

    let opened = try_open(&pool, &record).await;

    // Handles to close once the pool lock is released.
    let mut stale = Vec::new();

    if opened {
        let swapped_in = {
            let mut state = pool.state().lock();
            let replaced_active = state.active.replace(Arc::clone(&record));
            let replaced_cache = state.cache.replace(Arc::clone(&record));

            match (replaced_active, replaced_cache) {
                (Some(old), cache_old) => {
                    record.set_state(TunnelState::Open);
                    if let Some(handle) = old.release() {
                        stale.push(handle);
                    }
                    // In steady state the cache held the same record; if the
                    // sets had diverged, retire the cache instance too.
                    if let Some(other) = cache_old {
                        if !Arc::ptr_eq(&other, &old) {
                            if let Some(handle) = other.release() {
                                stale.push(handle);
                            }
                        }
                    }
                    true
                }
                (None, Some(old)) => {
                    // No longer active: keep the fresh record cached but
                    // unused.
                    let mut inner = record.lock();
                    if let Some(handle) = inner.handle.take() {
                        stale.push(handle);
                    }
                    inner.state = TunnelState::Dead;
                    inner.reconnect = false;
                    drop(inner);
                    if let Some(handle) = old.release() {
                        stale.push(handle);
                    }
                    true
                }
                (None, None) => {
                    // URL vanished from both sets while we were opening.
                    if let Some(handle) = record.lock().handle.take() {
                        stale.push(handle);
                    }
                    false
                }
            }
        };

        if swapped_in {
            info!(url = %record.url(), "reopened tunnel");
        } else {
            debug!(url = %record.url(), "tunnel removed while reconnecting; discarding");
        }
    } else {
        warn!(url = %url, "unable to reopen tunnel; deactivating");
        let mut state = pool.state().lock();
        if state.active.delete(&url).is_some() {
            let mut inner = record.lock();
            if let Some(handle) = inner.handle.take() {
                stale.push(handle);
            }
            inner.state = TunnelState::Dead;
            inner.reconnect = false;
        }
    }

    for handle in stale {
        handle.close().await;
    }
}
