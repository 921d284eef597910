//! Connection accounting
//!
//! Sharded counters keyed by local peer index. The liveness logic that reads
//! them lives outside the datapath; emission only ticks.

use dashmap::DashMap;

/// Per-peer traffic counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnCounters {
    /// Outbound frames emitted
    pub out_packets: u64,
    /// Frames relayed through this tunnel
    pub relays_used: u64,
}

/// Lock-free-sharded connection counters
#[derive(Default)]
pub struct ConnectionManager {
    counters: DashMap<u32, ConnCounters>,
}

impl ConnectionManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound frame for a peer
    pub fn out(&self, local_index: u32) {
        self.counters.entry(local_index).or_default().out_packets += 1;
    }

    /// Record a frame forwarded through a relay tunnel
    pub fn relay_used(&self, local_index: u32) {
        self.counters.entry(local_index).or_default().relays_used += 1;
    }

    /// Counter snapshot for a peer
    pub fn snapshot(&self, local_index: u32) -> ConnCounters {
        self.counters
            .get(&local_index)
            .map(|c| *c)
            .unwrap_or_default()
    }
}
