//! Weighted tunnel selection with per-flow history
//!
//! Selection is hash-driven rather than random: the same flow hash always
//! lands on the same tunnel for a given weight snapshot, so a flow sticks
//! to one tunnel while things are healthy. Retransmissions (`repeat > 0`)
//! perturb the pick and feed the history table, which remembers which
//! tunnel carried a flow last and demotes it when the flow had to be
//! resent. Weights move multiplicatively within a clamped range, so a
//! misbehaving tunnel fades quickly but can always earn its way back.
//!
//! The history table is a fixed 1024-slot hint keyed by `flow_hash mod
//! 1024`. Collisions are tolerated: a wrong demotion costs a little weight,
//! never correctness. Slots store the instance id, not the URL, so a
//! reconnect-replaced tunnel does not inherit blame aimed at its
//! predecessor.

use super::record::TunnelRef;
use super::set::TunnelSet;

/// Number of flow-history slots
pub(crate) const HISTORY_SIZE: usize = 1024;

/// One flow-history slot, overwritten on every selection
#[derive(Debug, Clone, Copy, Default)]
struct HistorySlot {
    hash: u32,
    id: u16,
}

/// Fixed-size table mapping flow-hash buckets to the last selected tunnel
pub(crate) struct TunnelHistory {
    slots: Box<[HistorySlot; HISTORY_SIZE]>,
}

impl TunnelHistory {
    pub fn new() -> Self {
        Self {
            slots: Box::new([HistorySlot::default(); HISTORY_SIZE]),
        }
    }
}

/// Pick a tunnel from the active set for the given flow.
///
/// Runs under the pool lock; the only per-record work is a brief weight
/// read or adjustment. Returns `None` when the active set is empty.
pub(crate) fn select(
    active: &TunnelSet,
    history: &mut TunnelHistory,
    flow_hash: u64,
    repeat: u32,
) -> Option<TunnelRef> {
    if active.is_empty() {
        return None;
    }

    let hist_idx = (flow_hash % HISTORY_SIZE as u64) as usize;
    let hist_hash = (flow_hash as u32) ^ ((flow_hash >> 32) as u32);
    let weight_hash = hist_hash.wrapping_mul(repeat.wrapping_add(1));

    let total_weight: f64 = active.iter().map(|t| t.lock().weight).sum();
    let mut pick = (f64::from(weight_hash) / 2f64.powi(32)) * total_weight;

    // Cumulative walk; the clamp to the last index covers float rounding
    // when pick is within an ulp of the total.
    let mut idx = active.len() - 1;
    for i in 0..active.len() {
        let weight = active.get(i).lock().weight;
        if pick < weight {
            idx = i;
            break;
        }
        pick -= weight;
    }

    if repeat != 0 {
        // The flow was retransmitted. That can happen for many reasons, but
        // one of them is that the tunnel which carried the first attempt
        // dropped it, so if the history still remembers this flow, demote
        // that tunnel and steer the retransmission elsewhere.
        let slot = history.slots[hist_idx];
        if slot.hash == hist_hash {
            if let Some(blamed) = active.iter().position(|t| t.id() == slot.id) {
                active.get(blamed).lock().demote_weight();
                if blamed == idx {
                    idx = (idx + 1) % active.len();
                }
            }
        }
    }

    let selected = active.get(idx).clone();

    // Assume the send will succeed and nudge the weight back up.
    selected.lock().reward_weight();

    history.slots[hist_idx] = HistorySlot {
        hash: hist_hash,
        id: selected.id(),
    };

    Some(selected)
}
