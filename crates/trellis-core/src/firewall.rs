//! Firewall seam and per-worker conntrack cache
//!
//! Rule compilation and evaluation live outside this crate; the datapath only
//! consumes a pure decision function. The conntrack cache memoizes allow
//! decisions per worker, trading cross-worker consistency for lock-free
//! lookups.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::session::Peer;
use trellis_net::FlowPacket;

/// Why the firewall refused a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No rule matched the flow
    NoMatchingRule,
    /// A rule matched and denies the flow
    Denied,
    /// The local address is not ours to speak for
    InvalidLocalIp,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingRule => write!(f, "no matching rule"),
            Self::Denied => write!(f, "denied by rule"),
            Self::InvalidLocalIp => write!(f, "invalid local ip"),
        }
    }
}

/// The firewall decision function consumed by the datapath
pub trait Firewall: Send + Sync {
    /// `None` allows the packet; `Some(reason)` drops (and possibly rejects)
    /// it. The conntrack cache, when present, is worker-local.
    fn drop_reason(
        &self,
        packet: &FlowPacket,
        inbound: bool,
        peer: &Peer,
        cache: Option<&mut ConntrackCache>,
    ) -> Option<DropReason>;
}

/// A firewall that allows everything; useful for wiring and tests
pub struct AllowAll;

impl Firewall for AllowAll {
    fn drop_reason(
        &self,
        _packet: &FlowPacket,
        _inbound: bool,
        _peer: &Peer,
        _cache: Option<&mut ConntrackCache>,
    ) -> Option<DropReason> {
        None
    }
}

/// Worker-local memoization of allow decisions, keyed by flow tuple.
///
/// Entries live for one timeout window; the whole cache is swept rather than
/// aged per entry, which keeps the hot path to a single hash lookup. A zero
/// timeout disables the cache entirely.
pub struct ConntrackCache {
    entries: HashMap<FlowPacket, ()>,
    timeout: Duration,
    swept_at: Instant,
}

impl ConntrackCache {
    /// Create a cache with the given window; zero disables it
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
            swept_at: Instant::now(),
        }
    }

    /// Whether this flow was allowed within the current window
    pub fn check(&mut self, packet: &FlowPacket) -> bool {
        if self.timeout.is_zero() {
            return false;
        }
        self.maybe_sweep();
        self.entries.contains_key(packet)
    }

    /// Record an allow decision for this flow
    pub fn record(&mut self, packet: FlowPacket) {
        if self.timeout.is_zero() {
            return;
        }
        self.maybe_sweep();
        self.entries.insert(packet, ());
    }

    /// Cached flow count, for stats
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no flows
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&mut self) {
        if self.swept_at.elapsed() >= self.timeout {
            self.entries.clear();
            self.swept_at = Instant::now();
        }
    }
}
