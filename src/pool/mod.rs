//! Tunnel pool
//!
//! The pool owns two record sets — the *cache* (every tunnel we know about,
//! persisted across runs) and the *active* set (tunnels currently open for
//! forwarding) — plus the selector history and the jitter RNG. One
//! `parking_lot` mutex guards all of it: the forwarding hot path holds it
//! for a selection and an MTU check, background managers hold it for set
//! walks, and every blocking transport call (open, close, send,
//! fragmentation) happens with the lock released.
//!
//! # Lifecycle
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunnel_pool::{PoolConfig, TunnelPool};
//! # fn daemon_transport() -> Arc<dyn tunnel_pool::Transport> { unimplemented!() }
//!
//! # fn example() -> Result<(), tunnel_pool::ConfigError> {
//! let pool = TunnelPool::new(PoolConfig::default(), daemon_transport())?;
//! pool.load_cache();
//! pool.open();
//! # Ok(())
//! # }
//! ```
//!
//! `new` corresponds to module initialisation (call it once), `load_cache`
//! restores the persisted cache, and `open` starts the background
//! activation and reconnection managers. After that the daemon drives the
//! pool through [`TunnelPool::forward_packets`], [`TunnelPool::add`] and
//! [`TunnelPool::delete`]. `TunnelPool` is a cheap handle: clone it freely
//! into the packet pipeline and control surfaces.

mod activator;
mod reconnect;
mod record;
mod selector;
mod set;

pub use record::{TunnelInfo, TunnelState, WEIGHT_CEIL, WEIGHT_FLOOR};

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::http::{render_options, PageRegistry, ACTIVE_PAGE, ALL_PAGE};
use crate::packet::packet_len;
use crate::persist::{self, CacheRecord, MAX_URL_LENGTH};
use crate::transport::{Transport, TunnelHandle};

use record::TunnelRef;
use selector::TunnelHistory;
use set::TunnelSet;

/// Which record set a listing operation reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelView {
    /// Tunnels currently open for forwarding
    Active,
    /// Every known tunnel
    All,
}

/// Everything the pool mutex protects
pub(crate) struct PoolState {
    /// All known tunnels, persisted across runs
    pub cache: TunnelSet,
    /// Tunnels currently usable for forwarding
    pub active: TunnelSet,
    /// Per-flow selection history
    pub history: TunnelHistory,
    /// Jitter source for manager and worker sleeps
    pub rng: SmallRng,
    /// Next instance id; monotonic, never reused
    pub next_id: u16,
}

/// State shared by every handle to one pool
struct PoolShared {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<PoolState>,
    /// Serialises cache-file writers; never held together with `state`
    persist_lock: Mutex<()>,
}

/// Concurrent manager of outbound tunnels
#[derive(Clone)]
pub struct TunnelPool {
    inner: Arc<PoolShared>,
}

/// Outcome of the locked phase of `forward_packets`
enum Forward {
    NoTunnel,
    Fault,
    Fragment(Arc<dyn TunnelHandle>, u16),
    Send(Arc<dyn TunnelHandle>),
}

impl TunnelPool {
    /// Create a pool.
    ///
    /// Call exactly once per daemon; the pool is the process-wide owner of
    /// its cache file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration fails validation.
    pub fn new(config: PoolConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolShared {
                config,
                transport,
                state: Mutex::new(PoolState {
                    cache: TunnelSet::new(),
                    active: TunnelSet::new(),
                    history: TunnelHistory::new(),
                    rng: SmallRng::from_entropy(),
                    next_id: 0,
                }),
                persist_lock: Mutex::new(()),
            }),
        })
    }

    /// The pool's configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn state(&self) -> &Mutex<PoolState> {
        &self.inner.state
    }

    /// Register the status pages with the daemon's HTTP server
    pub fn register_status_pages(&self, registry: &dyn PageRegistry) {
        let pool = self.clone();
        registry.register_page(
            ACTIVE_PAGE,
            Box::new(move |out| pool.render_list(TunnelView::Active, out)),
        );
        let pool = self.clone();
        registry.register_page(
            ALL_PAGE,
            Box::new(move |out| pool.render_list(TunnelView::All, out)),
        );
    }

    /// Restore the persisted cache.
    ///
    /// Call once at startup, before [`TunnelPool::open`]. Restored records
    /// start `Closed` with their persisted age; the activation manager
    /// picks them up from there.
    pub fn load_cache(&self) {
        let records = persist::read_cache(&self.inner.config.cache_path);
        if records.is_empty() {
            return;
        }

        let mut state = self.inner.state.lock();
        for CacheRecord { url, age } in records {
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1);
            state.cache.insert(record::Tunnel::new(&url, age, id));
        }
        info!(tunnels = state.cache.len(), "restored tunnel cache");
    }

    /// Start the background managers.
    ///
    /// Spawns the activation manager (opens cached tunnels up to the
    /// configured budget) and the reconnection manager (replaces expired
    /// tunnels). Both are detached tasks; there is no shutdown entry point
    /// in this core.
    pub fn open(&self) {
        activator::spawn_manager(self.clone());
        reconnect::spawn_manager(self.clone());
    }

    /// Whether at least one tunnel is open for forwarding
    pub fn ready(&self) -> bool {
        !self.inner.state.lock().active.is_empty()
    }

    /// Add a tunnel by URL.
    ///
    /// Unknown URLs are created with the initial age; known URLs are
    /// re-armed unless they are already open or opening. Either way a
    /// worker is spawned to open the tunnel and the cache file is
    /// rewritten. Syntactically invalid URLs (per the transport), URLs
    /// containing whitespace and over-long URLs are rejected: the first
    /// silently, the latter two with a warning (they could never be
    /// persisted).
    pub fn add(&self, url: &str) {
        if url.is_empty() || url.len() > MAX_URL_LENGTH || url.contains(char::is_whitespace) {
            warn!(url, "rejecting unrepresentable tunnel URL");
            return;
        }
        if !self.inner.transport.parse_url(url) {
            debug!(url, "rejecting syntactically invalid tunnel URL");
            return;
        }

        let record = {
            let mut state = self.inner.state.lock();
            let record = match state.cache.lookup(url) {
                None => {
                    let id = state.next_id;
                    state.next_id = state.next_id.wrapping_add(1);
                    let record = record::Tunnel::new(url, self.inner.config.init_age, id);
                    state.cache.insert(Arc::clone(&record));
                    record
                }
                Some(idx) => {
                    let record = Arc::clone(state.cache.get(idx));
                    let current = record.state();
                    if matches!(current, TunnelState::Open | TunnelState::Opening) {
                        drop(state);
                        warn!(url, state = %current, "unable to add tunnel; already open or opening");
                        return;
                    }
                    record
                }
            };
            record.set_state(TunnelState::Opening);
            record
        };

        info!(url, "added tunnel");
        activator::spawn_worker(self.clone(), record);

        self.write_cache_file();
    }

    /// Delete a tunnel by URL.
    ///
    /// An active tunnel is deactivated according to its state (an in-flight
    /// open is flagged and torn down by its worker); an inactive one is
    /// removed from the cache entirely. The cache file is rewritten either
    /// way.
    pub async fn delete(&self, url: &str) {
        let mut stale_handle = None;
        {
            let mut state = self.inner.state.lock();
            if let Some(record) = state.active.delete(url) {
                let mut inner = record.lock();
                match inner.state {
                    TunnelState::Opening => inner.state = TunnelState::Closing,
                    TunnelState::Closing => {}
                    TunnelState::Open => {
                        stale_handle = inner.handle.take();
                        inner.state = TunnelState::Closed;
                    }
                    other => unreachable!("active tunnel {url} in state {other}"),
                }
                info!(url, "deactivated tunnel");
            } else if let Some(record) = state.cache.delete(url) {
                stale_handle = record.release();
                info!(url, "deleted tunnel");
            } else {
                warn!(url, "unable to delete tunnel; tunnel does not exist");
            }
        }

        if let Some(handle) = stale_handle {
            handle.close().await;
        }

        self.write_cache_file();
    }

    /// Forward a batch of packets belonging to one flow.
    ///
    /// Selects a tunnel for `flow_hash`, then either hands every packet to
    /// the transport or — when any packet's declared IP length exceeds the
    /// tunnel MTU — asks the transport to signal fragmentation for the
    /// primary packet instead (still a success: the peer will resend
    /// smaller). Returns `false` when no tunnel is available (the batch is
    /// dropped) or the selected tunnel reports an unusable MTU.
    ///
    /// `repeat` is the retransmission index of the batch; non-zero values
    /// feed the selector's blame history.
    pub async fn forward_packets(
        &self,
        primary: &[u8],
        packets: &[&[u8]],
        flow_hash: u64,
        repeat: u32,
        config_mtu: u16,
    ) -> bool {
        let decision = {
            let mut state = self.inner.state.lock();
            let PoolState {
                ref active,
                ref mut history,
                ..
            } = *state;

            match selector::select(active, history, flow_hash, repeat) {
                None => Forward::NoTunnel,
                Some(tunnel) => match tunnel.lock().handle.clone() {
                    None => Forward::Fault,
                    Some(handle) => {
                        let mtu = handle.effective_mtu(config_mtu);
                        if mtu == 0 {
                            Forward::Fault
                        } else {
                            let mut fit = true;
                            for packet in packets {
                                let len = packet_len(packet);
                                if len > usize::from(mtu) {
                                    fit = false;
                                    debug!(len, mtu, "unable to tunnel packet; exceeds tunnel MTU");
                                }
                            }
                            if fit {
                                Forward::Send(handle)
                            } else {
                                Forward::Fragment(handle, mtu)
                            }
                        }
                    }
                },
            }
        };

        match decision {
            Forward::NoTunnel => {
                warn!("unable to tunnel packet (no suitable tunnel is open); dropping");
                false
            }
            Forward::Fault => false,
            Forward::Fragment(handle, mtu) => {
                handle.fragmentation_required(mtu, primary).await;
                true
            }
            Forward::Send(handle) => {
                for packet in packets {
                    handle.send(packet).await;
                }
                true
            }
        }
    }

    /// Append the chosen set as `<option>` lines
    pub fn render_list(&self, view: TunnelView, out: &mut String) {
        let state = self.inner.state.lock();
        let set = match view {
            TunnelView::Active => &state.active,
            TunnelView::All => &state.cache,
        };
        render_options(out, set.iter().map(|t| t.url().to_string()));
    }

    /// Point-in-time view of the chosen set
    pub fn snapshot(&self, view: TunnelView) -> Vec<TunnelInfo> {
        let state = self.inner.state.lock();
        let set = match view {
            TunnelView::Active => &state.active,
            TunnelView::All => &state.cache,
        };
        set.iter().map(|t| t.info()).collect()
    }

    /// Allocate a fresh record with the next instance id
    pub(crate) fn new_record(&self, url: &str, age: u8) -> TunnelRef {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        record::Tunnel::new(url, age, id)
    }

    /// Rewrite the cache file from the current cache set.
    ///
    /// Writers are serialised on a dedicated lock; the pool lock is taken
    /// only long enough to snapshot `(url, age)` pairs. Failures are
    /// logged and retried on the next write.
    pub(crate) fn write_cache_file(&self) {
        let _writers = self.inner.persist_lock.lock();

        let records: Vec<CacheRecord> = {
            let state = self.inner.state.lock();
            state
                .cache
                .iter()
                .map(|t| CacheRecord {
                    url: t.url().to_string(),
                    age: t.lock().age,
                })
                .collect()
        };

        if let Err(err) = persist::write_cache(&self.inner.config.cache_path, &records) {
            warn!(error = %err, "unable to write tunnel cache file");
        }
    }
}
