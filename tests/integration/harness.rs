//! Scripted stub transport
//!
//! Implements the transport contract with per-URL scripts: opens can be
//! made to fail, or to block on a gate until the test releases them.
//! Every opened handle records sends, fragmentation signals and closes,
//! and exposes a settable expiry flag so tests can drive the reconnect
//! loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use tunnel_pool::{PoolConfig, Transport, TransportError, TunnelHandle};

/// Per-URL open behaviour
#[derive(Default)]
struct UrlScript {
    /// Every open attempt fails
    fail: bool,
    /// Open attempts block until the test adds a permit
    gate: Option<Arc<Semaphore>>,
}

/// Transport whose behaviour is scripted per URL
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, UrlScript>>,
    handles: Mutex<Vec<Arc<ScriptedHandle>>>,
    opens: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            opens: Mutex::new(HashMap::new()),
        })
    }

    /// Make every open attempt for `url` fail
    pub fn fail_all(&self, url: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .fail = true;
    }

    /// Block open attempts for `url` until permits are added to the
    /// returned semaphore (one permit releases one attempt).
    pub fn gate(&self, url: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .gate = Some(Arc::clone(&gate));
        gate
    }

    /// Drop any script for `url`, restoring default (successful) opens
    pub fn clear_script(&self, url: &str) {
        self.scripts.lock().unwrap().remove(url);
    }

    /// Number of open attempts seen for `url`
    pub fn open_count(&self, url: &str) -> usize {
        self.opens.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Every handle successfully opened for `url`, in open order
    pub fn handles_for(&self, url: &str) -> Vec<Arc<ScriptedHandle>> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.url == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn parse_url(&self, url: &str) -> bool {
        url.contains("://") && !url.contains(char::is_whitespace)
    }

    async fn open(&self, url: &str) -> Result<Arc<dyn TunnelHandle>, TransportError> {
        *self
            .opens
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        let (fail, gate) = {
            let scripts = self.scripts.lock().unwrap();
            scripts
                .get(url)
                .map_or((false, None), |s| (s.fail, s.gate.clone()))
        };

        if let Some(gate) = gate {
            gate.acquire().await.expect("gate semaphore closed").forget();
        }
        if fail {
            return Err(TransportError::open_failed(url, "scripted failure"));
        }

        let handle = Arc::new(ScriptedHandle::new(url));
        self.handles.lock().unwrap().push(Arc::clone(&handle));
        Ok(handle)
    }
}

/// Handle returned by [`ScriptedTransport::open`]
pub struct ScriptedHandle {
    pub url: String,
    expired: AtomicBool,
    closed: AtomicBool,
    mtu_override: Mutex<Option<u16>>,
    sent: Mutex<Vec<Vec<u8>>>,
    fragmentation_signals: AtomicUsize,
}

impl ScriptedHandle {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            expired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            mtu_override: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            fragmentation_signals: AtomicUsize::new(0),
        }
    }

    /// Mark the tunnel as expired (picked up by the reconnect poll)
    pub fn set_expired(&self, expired: bool) {
        self.expired.store(expired, Ordering::SeqCst);
    }

    /// Override the effective MTU (`Some(0)` makes the tunnel unusable)
    pub fn set_mtu(&self, mtu: Option<u16>) {
        *self.mtu_override.lock().unwrap() = mtu;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fragmentation_signals(&self) -> usize {
        self.fragmentation_signals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelHandle for ScriptedHandle {
    async fn send(&self, packet: &[u8]) {
        self.sent.lock().unwrap().push(packet.to_vec());
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn fragmentation_required(&self, _mtu: u16, _packet: &[u8]) {
        self.fragmentation_signals.fetch_add(1, Ordering::SeqCst);
    }

    fn effective_mtu(&self, config_mtu: u16) -> u16 {
        self.mtu_override.lock().unwrap().unwrap_or(config_mtu)
    }

    fn is_expired(&self, _now: Instant) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

/// Pool configuration with test-friendly timings
pub fn fast_config(dir: &TempDir) -> PoolConfig {
    let mut config = PoolConfig::new()
        .with_cache_path(dir.path().join("TUNNELS"))
        .with_open_retry_base_ms(5)
        .with_activation_interval_ms(20)
        .with_reconnect_poll_ms(10);
    config.open_retry_jitter_ms = 2;
    config.activation_jitter_ms = 2;
    config.reconnect_jitter_ms = 2;
    config
}

/// A minimal IPv4 packet declaring the given total length
pub fn ipv4_packet(total_len: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet
}

/// Poll until `cond` holds, panicking after a generous deadline
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}
