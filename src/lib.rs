//! tunnel-pool: outbound tunnel management for a packet-forwarding daemon
//!
//! This crate keeps a fleet of encrypted transport tunnels alive and picks
//! one per packet flow. The daemon hands it IP packets tagged with a flow
//! hash; the pool selects a live tunnel by adaptive weight, forwards the
//! packets, and maintains the fleet in the background — opening cached
//! tunnels with bounded backoff, replacing expired ones, and persisting
//! tunnel identities across restarts.
//!
//! # Architecture
//!
//! ```text
//! packet pipeline ── forward_packets ──> Selector ──> Transport::send
//!                                           │
//!                       cache set ──────────┤ active set
//!                           ↑               ↑
//!                 Activation manager   Reconnect manager
//!                  (open workers)      (replace workers)
//! ```
//!
//! The underlying transport (open/close/send/MTU/expiry) is a trait the
//! daemon implements; the pool contains no protocol code.
//!
//! # Modules
//!
//! - [`config`]: Pool tunables and loading
//! - [`error`]: Error types
//! - [`http`]: Status page registration seam
//! - [`packet`]: IP header length inspection
//! - [`persist`]: Cache file format and rotation
//! - [`pool`]: The pool itself
//! - [`transport`]: The transport contract

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod http;
pub mod packet;
pub mod persist;
pub mod pool;
pub mod transport;

// Re-export commonly used types at the crate root
pub use config::{load_config, load_config_str, PoolConfig};
pub use error::{ConfigError, PersistError, PoolError, Result};
pub use http::{PageHandler, PageRegistry, ACTIVE_PAGE, ALL_PAGE};
pub use persist::{CacheRecord, MAX_URL_LENGTH};
pub use pool::{TunnelInfo, TunnelPool, TunnelState, TunnelView};
pub use transport::{Transport, TransportError, TunnelHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
