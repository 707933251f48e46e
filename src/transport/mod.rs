//! Transport contract
//!
//! This module defines the seam between the tunnel pool and the underlying
//! encrypted transport. The pool opens tunnels, sends packets and asks
//! expiry questions exclusively through these traits; it never performs
//! protocol negotiation, cryptography or DNS itself.
//!
//! # Blocking behaviour
//!
//! `Transport::open`, `TunnelHandle::send`, `TunnelHandle::close` and
//! `TunnelHandle::fragmentation_required` may block for network round
//! trips; the pool always calls them with its internal lock released.
//! `effective_mtu` and `is_expired` are cheap predicates and may be called
//! under the lock.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;

/// Error produced by a transport when an open attempt fails
#[derive(Debug, Error)]
pub enum TransportError {
    /// URL uses a scheme this transport does not implement
    #[error("Unsupported tunnel scheme in {url}")]
    UnsupportedScheme { url: String },

    /// Endpoint could not be reached or rejected the handshake
    #[error("Failed to open tunnel {url}: {reason}")]
    OpenFailed { url: String, reason: String },
}

impl TransportError {
    /// Check if this error is recoverable (the open can be retried)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::UnsupportedScheme { .. } => false,
            Self::OpenFailed { .. } => true,
        }
    }

    /// Create an open-failed error
    pub fn open_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OpenFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Factory side of the transport contract
///
/// Implementations are shared across the pool's background tasks, so they
/// must be `Send + Sync`; per-tunnel state belongs on the [`TunnelHandle`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Syntactic URL check, used to reject garbage before it enters the
    /// cache. No network activity.
    fn parse_url(&self, url: &str) -> bool;

    /// Establish a tunnel to the endpoint named by `url`. May block for
    /// multiple network round trips.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the tunnel could not be established.
    async fn open(&self, url: &str) -> Result<Arc<dyn TunnelHandle>, TransportError>;
}

/// An established tunnel
#[async_trait]
pub trait TunnelHandle: Send + Sync + 'static {
    /// Send one packet. Best effort: delivery failures are the transport's
    /// problem and surface later as expiry.
    async fn send(&self, packet: &[u8]);

    /// Close the tunnel. Idempotent.
    async fn close(&self);

    /// Notify the peer that a packet exceeded the tunnel MTU
    async fn fragmentation_required(&self, mtu: u16, packet: &[u8]);

    /// Effective MTU for this tunnel given the configured MTU.
    ///
    /// Zero means the tunnel is unusable.
    fn effective_mtu(&self, config_mtu: u16) -> u16;

    /// Whether the tunnel has been silent long enough that it should be
    /// replaced.
    fn is_expired(&self, now: Instant) -> bool;
}
