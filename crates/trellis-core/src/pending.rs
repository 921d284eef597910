//! Cooperative handshake gating
//!
//! A packet for a peer without an established session is not sent and not
//! lost: it parks on the peer's pending slot, and the handshake manager
//! replays the queue in order the moment the session keys arrive. The enqueue
//! callback runs under the slot's queue lock, so there is no window between
//! the "not ready" decision and the packet landing in the queue.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use trellis_crypto::{SessionCipher, NONCE_SIZE};
use trellis_net::{MessageSubType, MessageType};

use crate::error::{CoreError, CoreResult};
use crate::hostmap::HostMap;
use crate::interface::Interface;
use crate::lighthouse::Lighthouse;
use crate::session::Peer;

/// A packet deferred until its peer's handshake completes
pub struct CachedPacket {
    pub msg_type: MessageType,
    pub subtype: MessageSubType,
    pub payload: Vec<u8>,
}

/// Bounded FIFO of deferred packets; overflow drops the oldest
pub struct PacketQueue {
    packets: VecDeque<CachedPacket>,
    cap: usize,
}

impl PacketQueue {
    fn new(cap: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(cap.min(16)),
            cap,
        }
    }

    /// Append a packet, evicting the oldest when full
    pub fn push(&mut self, packet: CachedPacket) {
        if self.packets.len() >= self.cap {
            self.packets.pop_front();
            trace!("pending queue full, dropped oldest packet");
        }
        self.packets.push_back(packet);
    }

    /// Number of queued packets
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn drain_all(&mut self) -> VecDeque<CachedPacket> {
        std::mem::take(&mut self.packets)
    }
}

/// One pending handshake: the tentative peer and its deferred packets
pub struct PendingSlot {
    /// The peer being handshaken, still in the NoKey state
    pub peer: Arc<Peer>,
    queue: Mutex<PacketQueue>,
}

impl PendingSlot {
    fn new(peer: Arc<Peer>, cap: usize) -> Self {
        Self {
            peer,
            queue: Mutex::new(PacketQueue::new(cap)),
        }
    }

    /// Number of packets parked on this slot
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Gates traffic on session establishment.
///
/// Holds a weak reference to the interface; the cycle (interface -> manager ->
/// interface) is resolved by wiring after construction, with the interface as
/// the single owner.
pub struct HandshakeManager {
    hostmap: Arc<HostMap>,
    lighthouse: Arc<dyn Lighthouse>,
    pending: RwLock<HashMap<IpAddr, Arc<PendingSlot>>>,
    iface: OnceLock<Weak<Interface>>,
    next_index: AtomicU32,
    queue_cap: usize,
}

impl HandshakeManager {
    /// Create a manager over the given host map and lighthouse
    pub fn new(
        hostmap: Arc<HostMap>,
        lighthouse: Arc<dyn Lighthouse>,
        queue_cap: usize,
    ) -> Self {
        Self {
            hostmap,
            lighthouse,
            pending: RwLock::new(HashMap::new()),
            iface: OnceLock::new(),
            next_index: AtomicU32::new(1),
            queue_cap,
        }
    }

    /// Wire the interface in after construction
    pub fn wire_interface(&self, iface: &Arc<Interface>) {
        let _ = self.iface.set(Arc::downgrade(iface));
    }

    /// Look up an established peer or start a handshake.
    ///
    /// Returns `(peer, true)` when the session is ready. Otherwise the packet
    /// can be parked via `on_queue`, which runs under the slot's queue lock
    /// and must not block; the return is `(pending_peer, false)`: queued, do
    /// not send now.
    pub fn get_or_handshake(
        &self,
        vpn_ip: IpAddr,
        on_queue: Option<&dyn Fn(&mut PacketQueue)>,
    ) -> (Option<Arc<Peer>>, bool) {
        if let Some(peer) = self.hostmap.get(vpn_ip) {
            if peer.session.is_keyed() {
                return (Some(peer), true);
            }
        }

        let slot = self.slot_for(vpn_ip);
        if let Some(cb) = on_queue {
            let mut queue = slot.queue.lock();
            cb(&mut queue);
        }
        (Some(slot.peer.clone()), false)
    }

    fn slot_for(&self, vpn_ip: IpAddr) -> Arc<PendingSlot> {
        if let Some(slot) = self.pending.read().get(&vpn_ip) {
            return slot.clone();
        }

        let mut pending = self.pending.write();
        // lost the race to another worker?
        if let Some(slot) = pending.get(&vpn_ip) {
            return slot.clone();
        }

        // Reuse a published-but-unkeyed peer if one exists
        let peer = self.hostmap.get(vpn_ip).unwrap_or_else(|| {
            Arc::new(Peer::new(
                vpn_ip,
                self.next_index.fetch_add(1, Ordering::Relaxed),
            ))
        });
        let slot = Arc::new(PendingSlot::new(peer, self.queue_cap));
        pending.insert(vpn_ip, slot.clone());
        drop(pending);

        debug!(peer = %vpn_ip, "starting handshake");
        self.lighthouse.query_server(vpn_ip);
        slot
    }

    /// The pending slot for an address, if a handshake is in flight
    pub fn pending(&self, vpn_ip: IpAddr) -> Option<Arc<PendingSlot>> {
        self.pending.read().get(&vpn_ip).cloned()
    }

    /// Number of handshakes in flight
    pub fn pending_len(&self) -> usize {
        self.pending.read().len()
    }

    /// Finish a handshake: install the session key, publish the peer, and
    /// replay the deferred packets in FIFO order.
    ///
    /// The replayed packets take counters 1, 2, 3... on the fresh session.
    /// `nb` and `out` are the caller's reusable buffers.
    pub fn complete(
        &self,
        vpn_ip: IpAddr,
        cipher: SessionCipher,
        remote_index: u32,
        remote: Option<SocketAddr>,
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
    ) -> CoreResult<()> {
        let slot = self
            .pending
            .write()
            .remove(&vpn_ip)
            .ok_or(CoreError::NotPending(vpn_ip))?;

        slot.peer.set_remote_index(remote_index);
        slot.peer.set_remote(remote);
        if !slot.peer.session.install_cipher(cipher) {
            debug!(peer = %vpn_ip, "session already keyed, keeping original key");
        }
        self.hostmap.insert(slot.peer.clone());

        let packets = slot.queue.lock().drain_all();
        if packets.is_empty() {
            return Ok(());
        }

        let Some(iface) = self.iface.get().and_then(Weak::upgrade) else {
            debug!(peer = %vpn_ip, dropped = packets.len(), "no interface wired, dropping deferred packets");
            return Ok(());
        };

        debug!(peer = %vpn_ip, count = packets.len(), "replaying deferred packets");
        for p in packets {
            iface.send_message_now(p.msg_type, p.subtype, &slot.peer, &p.payload, nb, out);
        }
        Ok(())
    }
}
