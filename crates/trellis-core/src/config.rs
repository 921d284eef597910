//! Datapath configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration surface owned by the outbound datapath
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathConfig {
    /// Drop packets addressed to the VPN subnet's broadcast address
    pub drop_local_broadcast: bool,

    /// Drop multicast packets
    pub drop_multicast: bool,

    /// Answer firewalled outbound packets with a reject on the device
    pub inside_send_reject: bool,

    /// Answer firewalled inbound packets with an encrypted reject
    pub outside_send_reject: bool,

    /// Number of worker threads (and device/socket queues), at least 1
    pub routines: usize,

    /// Fall back to relays when a peer has no reachable address
    pub use_relays: bool,

    /// This node is itself a relay; disables `use_relays`
    pub am_relay: bool,

    /// Width of the socket-rebind counter comparison, in bits.
    ///
    /// The original behavior is an 8-bit counter: a tunnel idle across exactly
    /// 256 rebinds misses one lighthouse re-query. Widen to taste.
    pub rebind_counter_bits: u32,

    /// Packets queued per pending handshake before the oldest is dropped
    pub pending_queue_size: usize,

    /// Per-worker conntrack cache lifetime; zero disables the cache
    pub conntrack_cache_timeout: Duration,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            drop_local_broadcast: false,
            drop_multicast: false,
            inside_send_reject: true,
            outside_send_reject: false,
            routines: 1,
            use_relays: true,
            am_relay: false,
            rebind_counter_bits: 8,
            pending_queue_size: 100,
            conntrack_cache_timeout: Duration::ZERO,
        }
    }
}

impl DatapathConfig {
    /// Relays are used only when enabled and this node is not one itself
    pub fn effective_use_relays(&self) -> bool {
        self.use_relays && !self.am_relay
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.routines == 0 {
            return Err("routines must be at least 1".into());
        }
        if self.rebind_counter_bits == 0 || self.rebind_counter_bits > 64 {
            return Err(format!(
                "rebind_counter_bits must be in 1..=64, got {}",
                self.rebind_counter_bits
            ));
        }
        if self.pending_queue_size == 0 {
            return Err("pending_queue_size must be at least 1".into());
        }
        Ok(())
    }
}
