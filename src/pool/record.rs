//! Per-tunnel record and state machine
//!
//! A [`Tunnel`] pairs a stable identity (its URL) with a replaceable
//! instance (its numeric id): reconnecting builds a whole new record for
//! the same URL, and the selector's history table keys on the id so a
//! grudge against the old instance never lands on its replacement. Ids are
//! assigned monotonically by the pool and never reused.
//!
//! # State machine
//!
//! ```text
//! Closed ──activator claims──> Opening ──open ok──> Open
//!                                 │ retries exhausted──> Dead
//!                                 │ delete()──> Closing ──worker──> Closed
//!                                 │ free()───> Deleting ──worker──> (dropped)
//! Open ──delete()/close──> Closed          Dead ──add()──> Opening
//! ```
//!
//! External callers flip states under the pool lock and return; the open
//! worker observes the flip at its next checkpoint and performs the
//! terminal action. Nothing tears a record down while its open attempt is
//! still in flight.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::transport::TunnelHandle;

/// Lower clamp for selector weights. Keeps every active tunnel reachable:
/// a repeatedly blamed tunnel gets rare, not impossible.
pub const WEIGHT_FLOOR: f64 = 0.005;

/// Upper clamp for selector weights
pub const WEIGHT_CEIL: f64 = 1.0;

/// Multiplier applied to a blamed tunnel's weight
pub(crate) const WEIGHT_DEMOTE: f64 = 0.75;

/// Multiplier applied to a selected tunnel's weight
pub(crate) const WEIGHT_REWARD: f64 = 1.15;

/// Lifecycle state of a tunnel record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Not open; eligible for activation
    Closed,
    /// An open worker owns the record and is attempting to open it
    Opening,
    /// Open and usable for forwarding
    Open,
    /// Open attempts exhausted; not for use until re-added
    Dead,
    /// Scheduled to be closed; the open worker performs the close
    Closing,
    /// Scheduled to be dropped; the open worker performs the drop
    Deleting,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Dead => write!(f, "dead"),
            Self::Closing => write!(f, "closing"),
            Self::Deleting => write!(f, "deleting"),
        }
    }
}

/// Mutable portion of a tunnel record
pub(crate) struct TunnelInner {
    /// Current lifecycle state
    pub state: TunnelState,
    /// Guard against concurrent reconnect attempts for the same record
    pub reconnect: bool,
    /// Persisted reputation counter; 0 means "do not persist"
    pub age: u8,
    /// Selector quality score, clamped to `[WEIGHT_FLOOR, WEIGHT_CEIL]`
    pub weight: f64,
    /// Open transport, if the record currently has one
    pub handle: Option<Arc<dyn TunnelHandle>>,
}

impl TunnelInner {
    /// Reward a selected tunnel, clamped to the ceiling
    pub fn reward_weight(&mut self) {
        self.weight = (self.weight * WEIGHT_REWARD).min(WEIGHT_CEIL);
    }

    /// Demote a blamed tunnel, clamped to the floor
    pub fn demote_weight(&mut self) {
        self.weight = (self.weight * WEIGHT_DEMOTE).max(WEIGHT_FLOOR);
    }
}

/// A single tunnel record
///
/// Shared between the cache set, the active set and any worker task that
/// currently owns its open attempt. The identity fields are immutable; the
/// rest sits behind a record mutex that is only ever taken after the pool
/// lock (or alone, at worker checkpoints).
pub struct Tunnel {
    url: String,
    id: u16,
    inner: Mutex<TunnelInner>,
}

/// Shared reference to a tunnel record
pub(crate) type TunnelRef = Arc<Tunnel>;

impl Tunnel {
    /// Create a record in `Closed` state with the given age
    pub(crate) fn new(url: &str, age: u8, id: u16) -> TunnelRef {
        Arc::new(Self {
            url: url.to_string(),
            id,
            inner: Mutex::new(TunnelInner {
                state: TunnelState::Closed,
                reconnect: false,
                age,
                weight: WEIGHT_CEIL,
                handle: None,
            }),
        })
    }

    /// The record's URL (stable identity key)
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The record's instance id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Lock the mutable portion
    pub(crate) fn lock(&self) -> MutexGuard<'_, TunnelInner> {
        self.inner.lock()
    }

    /// Sample the current state
    pub(crate) fn state(&self) -> TunnelState {
        self.inner.lock().state
    }

    /// Set the state
    pub(crate) fn set_state(&self, state: TunnelState) {
        self.inner.lock().state = state;
    }

    /// Retire this record, yielding any transport handle the caller must
    /// close once all locks are released.
    ///
    /// A record in `Opening` cannot be torn down here: its open attempt is
    /// still in flight, so it is flagged `Deleting` and the worker drops it
    /// at the next checkpoint. `Deleting` records already belong to their
    /// worker.
    pub(crate) fn release(&self) -> Option<Arc<dyn TunnelHandle>> {
        let mut inner = self.inner.lock();
        match inner.state {
            TunnelState::Opening => {
                inner.state = TunnelState::Deleting;
                None
            }
            TunnelState::Deleting => None,
            _ => inner.handle.take(),
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Tunnel")
            .field("url", &self.url)
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("age", &inner.age)
            .field("weight", &inner.weight)
            .field("reconnect", &inner.reconnect)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a record, for status pages and introspection
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Tunnel URL
    pub url: String,
    /// Instance id
    pub id: u16,
    /// Lifecycle state
    pub state: TunnelState,
    /// Persisted age
    pub age: u8,
    /// Selector weight
    pub weight: f64,
}

impl Tunnel {
    /// Snapshot this record
    pub(crate) fn info(&self) -> TunnelInfo {
        let inner = self.inner.lock();
        TunnelInfo {
            url: self.url.clone(),
            id: self.id,
            state: inner.state,
            age: inner.age,
            weight: inner.weight,
        }
    }
}
