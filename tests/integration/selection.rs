//! Forwarding and selection scenarios
//!
//! Flow affinity, retransmission blame, MTU handling and the
//! fragmentation signal, all observed through scripted handles.

use std::sync::Arc;

use tempfile::TempDir;

use tunnel_pool::{TunnelPool, TunnelView};

use super::harness::{fast_config, ipv4_packet, wait_for, ScriptedHandle, ScriptedTransport};

const FLOW: u64 = 0x5151_d00d_1234_abcd;
const MTU: u16 = 1500;

/// Pool with `urls` opened and active
async fn active_pool(
    dir: &TempDir,
    transport: &Arc<ScriptedTransport>,
    urls: &[&str],
) -> TunnelPool {
    let pool = TunnelPool::new(fast_config(dir), Arc::clone(transport) as _).unwrap();
    for url in urls {
        pool.add(url);
    }
    let want = urls.len();
    wait_for("tunnels active", || {
        pool.snapshot(TunnelView::Active).len() == want
    })
    .await;
    pool
}

fn total_sent(handles: &[Arc<ScriptedHandle>]) -> usize {
    handles.iter().map(|h| h.sent().len()).sum()
}

// ============================================================================
// Flow affinity
// ============================================================================

#[tokio::test]
async fn test_same_flow_sticks_to_one_tunnel() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let pool = active_pool(&dir, &transport, &["a://x", "a://y"]).await;

    let packet = ipv4_packet(100);
    for _ in 0..5 {
        assert!(pool.forward_packets(&packet, &[&packet], FLOW, 0, MTU).await);
    }

    let x = transport.handles_for("a://x");
    let y = transport.handles_for("a://y");
    let (x_sent, y_sent) = (total_sent(&x), total_sent(&y));
    assert_eq!(x_sent + y_sent, 5);
    assert!(
        x_sent == 0 || y_sent == 0,
        "a repeated flow must stay on one tunnel while weights are stable"
    );
}

// ============================================================================
// Retransmission blame
// ============================================================================

#[tokio::test]
async fn test_retransmission_demotes_and_switches_tunnel() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let pool = active_pool(&dir, &transport, &["a://x", "a://y"]).await;

    let packet = ipv4_packet(100);
    assert!(pool.forward_packets(&packet, &[&packet], FLOW, 0, MTU).await);

    let first_receiver = ["a://x", "a://y"]
        .into_iter()
        .find(|url| total_sent(&transport.handles_for(url)) == 1)
        .expect("one tunnel carried the first send");

    // The flow comes back as a retransmission: the tunnel that carried it
    // takes the blame and the retry goes elsewhere.
    assert!(pool.forward_packets(&packet, &[&packet], FLOW, 1, MTU).await);

    let other = if first_receiver == "a://x" { "a://y" } else { "a://x" };
    assert_eq!(total_sent(&transport.handles_for(first_receiver)), 1);
    assert_eq!(total_sent(&transport.handles_for(other)), 1);

    let blamed = pool
        .snapshot(TunnelView::Active)
        .into_iter()
        .find(|t| t.url == first_receiver)
        .unwrap();
    assert!(
        (blamed.weight - 0.75).abs() < 1e-9,
        "blamed tunnel weight should be demoted to 0.75, got {}",
        blamed.weight
    );
}

// ============================================================================
// MTU handling
// ============================================================================

#[tokio::test]
async fn test_oversized_packet_triggers_fragmentation_signal() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let pool = active_pool(&dir, &transport, &["a://x"]).await;

    let handle = transport.handles_for("a://x")[0].clone();
    handle.set_mtu(Some(100));

    let small = ipv4_packet(80);
    let big = ipv4_packet(200);

    // One oversized packet poisons the whole batch: nothing is sent, the
    // peer is told to fragment, and the batch still counts as handled.
    assert!(
        pool.forward_packets(&big, &[&small, &big], FLOW, 0, MTU)
            .await
    );
    assert_eq!(handle.fragmentation_signals(), 1);
    assert!(handle.sent().is_empty());

    // A fitting batch flows normally.
    assert!(pool.forward_packets(&small, &[&small], FLOW, 0, MTU).await);
    assert_eq!(handle.sent().len(), 1);
    assert_eq!(handle.sent()[0], small);
}

#[tokio::test]
async fn test_zero_mtu_is_a_fault() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let pool = active_pool(&dir, &transport, &["a://x"]).await;

    let handle = transport.handles_for("a://x")[0].clone();
    handle.set_mtu(Some(0));

    let packet = ipv4_packet(100);
    assert!(!pool.forward_packets(&packet, &[&packet], FLOW, 0, MTU).await);
    assert!(handle.sent().is_empty());

    // The fault must not wedge the pool: selection keeps working.
    handle.set_mtu(None);
    assert!(pool.forward_packets(&packet, &[&packet], FLOW, 0, MTU).await);
}

#[tokio::test]
async fn test_forward_with_empty_active_set_drops() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let pool = TunnelPool::new(fast_config(&dir), Arc::clone(&transport) as _).unwrap();

    let packet = ipv4_packet(100);
    assert!(!pool.forward_packets(&packet, &[&packet], FLOW, 0, MTU).await);
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_batch_is_sent_in_order() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let pool = active_pool(&dir, &transport, &["a://x"]).await;

    let first = ipv4_packet(60);
    let second = ipv4_packet(70);
    let third = ipv4_packet(80);
    assert!(
        pool.forward_packets(&first, &[&first, &second, &third], FLOW, 0, MTU)
            .await
    );

    let handle = transport.handles_for("a://x")[0].clone();
    assert_eq!(handle.sent(), vec![first, second, third]);
}
