//! The outbound interface
//!
//! One packet in, zero or one packets out. A packet read from the device is
//! parsed, filtered, routed (balancing across equal-cost gateways when the
//! route has several), gated on session establishment, checked against the
//! firewall, then encrypted and written to a UDP queue; when the peer has no
//! reachable address the frame is double-wrapped and forwarded through a
//! relay peer instead. Every failure is absorbed here: the worker never sees
//! an error, and a packet is never both dropped and sent.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use trellis_crypto::{NONCE_SIZE, TAG_SIZE};
use trellis_net::header::{self, MessageSubType, MessageType};
use trellis_net::packet::{self, FlowPacket};
use trellis_net::reject::{create_reject_packet, MAX_REJECT_PACKET_SIZE};
use trellis_net::route::select_gateway;
use trellis_net::{Device, Gateway, IpNetwork, PacketWriter, HEADER_LEN};

use crate::config::DatapathConfig;
use crate::connmgr::ConnectionManager;
use crate::error::{CoreError, CoreResult};
use crate::firewall::{ConntrackCache, Firewall};
use crate::hostmap::HostMap;
use crate::lighthouse::Lighthouse;
use crate::pending::{CachedPacket, HandshakeManager, PacketQueue};
use crate::session::{Peer, Relay};

/// Where a destination leads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Inside our own VPN prefix; handshake directly
    Local(IpAddr),
    /// One configured gateway
    OneGateway(Gateway),
    /// Several gateways; balance, then fall back in declared order
    ManyGateways(Vec<Gateway>),
    /// Not in the mesh and no route covers it
    Unroutable,
}

/// Everything an [`Interface`] is wired up with
pub struct InterfaceConfig {
    pub device: Arc<dyn Device>,
    /// One UDP writer per worker queue
    pub writers: Vec<Arc<dyn PacketWriter>>,
    pub firewall: Arc<dyn Firewall>,
    pub hostmap: Arc<HostMap>,
    pub handshake_manager: Arc<HandshakeManager>,
    pub lighthouse: Arc<dyn Lighthouse>,
    pub connection_manager: Arc<ConnectionManager>,
    pub config: DatapathConfig,
    /// Device MTU; sizes the per-worker assembly buffers
    pub mtu: usize,
    /// Whether self-addressed packets go back out the device (Darwin and
    /// FreeBSD route self-to-self through the tun device; Linux never does)
    pub forward_self_through_tun: bool,
}

/// True on platforms that route self-to-self traffic through the tun device
pub fn platform_forwards_to_self() -> bool {
    cfg!(any(target_os = "macos", target_os = "freebsd"))
}

/// The outbound datapath
pub struct Interface {
    device: Arc<dyn Device>,
    writers: Vec<Arc<dyn PacketWriter>>,
    firewall: Arc<dyn Firewall>,
    hostmap: Arc<HostMap>,
    handshake_manager: Arc<HandshakeManager>,
    lighthouse: Arc<dyn Lighthouse>,
    connection_manager: Arc<ConnectionManager>,
    config: DatapathConfig,

    my_vpn_net: IpNetwork,
    my_vpn_ip: IpAddr,
    my_broadcast: Option<IpAddr>,
    forward_self: bool,
    mtu: usize,
    out_cap: usize,

    rebind_count: AtomicU64,
    rebind_mask: u64,
    stop: AtomicBool,
}

impl Interface {
    /// Wire up an interface. The handshake manager is linked back to the new
    /// interface here; the interface is the single owner of the cycle.
    pub fn new(cfg: InterfaceConfig) -> CoreResult<Arc<Self>> {
        cfg.config.validate().map_err(CoreError::Config)?;
        if cfg.writers.len() < cfg.config.routines {
            return Err(CoreError::Config(format!(
                "need one writer per routine: {} writers for {} routines",
                cfg.writers.len(),
                cfg.config.routines
            )));
        }
        if cfg.device.queue_count() < cfg.config.routines {
            return Err(CoreError::Config(format!(
                "device exposes {} queues but {} routines are configured",
                cfg.device.queue_count(),
                cfg.config.routines
            )));
        }

        let my_vpn_net = cfg.device.cidr();
        let rebind_mask = if cfg.config.rebind_counter_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << cfg.config.rebind_counter_bits) - 1
        };

        let iface = Arc::new(Self {
            my_vpn_ip: my_vpn_net.address,
            my_broadcast: my_vpn_net.broadcast(),
            my_vpn_net,
            forward_self: cfg.forward_self_through_tun,
            mtu: cfg.mtu,
            out_cap: cfg.mtu + HEADER_LEN + TAG_SIZE,
            rebind_count: AtomicU64::new(0),
            rebind_mask,
            stop: AtomicBool::new(false),
            device: cfg.device,
            writers: cfg.writers,
            firewall: cfg.firewall,
            hostmap: cfg.hostmap,
            handshake_manager: cfg.handshake_manager,
            lighthouse: cfg.lighthouse,
            connection_manager: cfg.connection_manager,
            config: cfg.config,
        });

        iface.handshake_manager.wire_interface(&iface);
        Ok(iface)
    }

    /// An assembly buffer sized for one frame: MTU plus header plus tag
    pub fn out_buffer(&self) -> Vec<u8> {
        Vec::with_capacity(self.out_cap)
    }

    /// The device this interface reads from
    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    /// Number of worker threads / queues
    pub fn routines(&self) -> usize {
        self.config.routines
    }

    /// Device MTU
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Datapath configuration
    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    /// The handshake manager gating this interface's traffic
    pub fn handshake_manager(&self) -> &Arc<HandshakeManager> {
        &self.handshake_manager
    }

    /// Record a socket rebind; the next send to each peer re-queries the
    /// lighthouse so the remote side punches toward our new address
    pub fn notify_rebind(&self) {
        self.rebind_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Ask workers to stop after their current packet
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Admit one packet read from device queue `q`.
    ///
    /// `fw`, `nb` and `out` are the worker's reusable scratch; `cache` is its
    /// conntrack cache. Exactly one of sent / queued / dropped happens.
    pub fn consume_inside_packet(
        &self,
        packet: &[u8],
        fw: &mut FlowPacket,
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
        q: usize,
        cache: Option<&mut ConntrackCache>,
    ) {
        if let Err(e) = packet::parse(packet, false, fw) {
            debug!("dropping malformed outbound packet: {e}");
            return;
        }

        if self.config.drop_local_broadcast && Some(fw.remote_ip) == self.my_broadcast {
            return;
        }

        if fw.remote_ip == self.my_vpn_ip {
            // Darwin and FreeBSD route packets from our VPN address to our
            // VPN address through the tun device; hand them straight back.
            // Linux sends those over loopback and never gets here.
            if self.forward_self {
                if let Err(e) = self.device.write(q, packet) {
                    error!("failed to forward packet back to device: {e}");
                }
            }
            return;
        }

        if self.config.drop_multicast && fw.remote_ip.is_multicast() {
            return;
        }

        let cache_packet = |queue: &mut PacketQueue| {
            queue.push(CachedPacket {
                msg_type: MessageType::Message,
                subtype: MessageSubType::None,
                payload: packet.to_vec(),
            });
        };
        let (peer, ready) = self.get_or_handshake_routing(fw, Some(&cache_packet));

        let Some(peer) = peer else {
            self.reject_inside(packet, out, q);
            debug!(
                remote = %fw.remote_ip,
                "dropping outbound packet, destination not in mesh and not routable"
            );
            return;
        };

        if !ready {
            // Parked on the pending slot; replayed at handshake completion
            return;
        }

        match self.firewall.drop_reason(fw, false, &peer, cache) {
            None => self.send_inner(
                MessageType::Message,
                MessageSubType::None,
                &peer,
                None,
                packet,
                nb,
                out,
                q,
            ),
            Some(reason) => {
                self.reject_inside(packet, out, q);
                debug!(remote = %fw.remote_ip, %reason, "dropping outbound packet");
            }
        }
    }

    /// Classify a destination against our prefix and the device route table
    pub fn resolve(&self, dest: IpAddr) -> Resolution {
        if self.my_vpn_net.contains(dest) {
            return Resolution::Local(dest);
        }
        let gateways = self.device.routes_for(dest);
        match gateways.len() {
            0 => Resolution::Unroutable,
            1 => Resolution::OneGateway(gateways[0]),
            _ => Resolution::ManyGateways(gateways),
        }
    }

    fn get_or_handshake_routing(
        &self,
        fw: &FlowPacket,
        on_queue: Option<&dyn Fn(&mut PacketQueue)>,
    ) -> (Option<Arc<Peer>>, bool) {
        match self.resolve(fw.remote_ip) {
            Resolution::Local(dest) => self.handshake_manager.get_or_handshake(dest, on_queue),
            Resolution::OneGateway(gw) => {
                self.handshake_manager.get_or_handshake(gw.ip(), on_queue)
            }
            Resolution::ManyGateways(gateways) => {
                let balanced = select_gateway(fw, &gateways);
                let (peer, ready) = self.handshake_manager.get_or_handshake(balanced, on_queue);
                if ready {
                    return (peer, ready);
                }

                debug!(
                    destination = %fw.remote_ip,
                    gateway = %balanced,
                    "balanced gateway not available, attempting other gateways"
                );

                // Falling back breaks flow affinity, but beats no connectivity
                let mut result = (peer, ready);
                for gw in &gateways {
                    if gw.ip() == balanced {
                        continue;
                    }
                    result = self.handshake_manager.get_or_handshake(gw.ip(), on_queue);
                    if result.1 {
                        break;
                    }
                }
                result
            }
            Resolution::Unroutable => (None, false),
        }
    }

    /// Start a handshake for an address inside the mesh, without routing
    pub fn handshake(&self, vpn_ip: IpAddr) {
        self.get_or_handshake_no_routing(vpn_ip, None);
    }

    fn get_or_handshake_no_routing(
        &self,
        vpn_ip: IpAddr,
        on_queue: Option<&dyn Fn(&mut PacketQueue)>,
    ) -> (Option<Arc<Peer>>, bool) {
        if !self.my_vpn_net.contains(vpn_ip) {
            return (None, false);
        }
        self.handshake_manager.get_or_handshake(vpn_ip, on_queue)
    }

    /// Answer a refused outbound packet on the device, policy permitting
    fn reject_inside(&self, packet: &[u8], out: &mut Vec<u8>, q: usize) {
        if !self.config.inside_send_reject {
            return;
        }
        if !create_reject_packet(packet, out) {
            return;
        }
        if let Err(e) = self.device.write(q, out) {
            error!("failed to write reject to device: {e}");
        }
    }

    /// Answer a refused inbound packet with an encrypted reject, policy and
    /// size cap permitting
    pub fn reject_outside(
        &self,
        packet: &[u8],
        peer: &Peer,
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
        q: usize,
    ) {
        if !self.config.outside_send_reject {
            return;
        }

        let mut reject = Vec::with_capacity(MAX_REJECT_PACKET_SIZE);
        if !create_reject_packet(packet, &mut reject) {
            return;
        }
        if reject.len() > MAX_REJECT_PACKET_SIZE {
            info!(len = reject.len(), "reject packet too big, not sending");
            return;
        }

        self.send_inner(
            MessageType::Message,
            MessageSubType::None,
            peer,
            None,
            &reject,
            nb,
            out,
            q,
        );
    }

    /// Send a message to a mesh address, handshaking first if needed.
    ///
    /// While the peer is pending the message parks on its slot and is
    /// replayed at completion.
    pub fn send_message_to_vpn_ip(
        &self,
        t: MessageType,
        st: MessageSubType,
        vpn_ip: IpAddr,
        payload: &[u8],
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
    ) {
        let cache_packet = |queue: &mut PacketQueue| {
            queue.push(CachedPacket {
                msg_type: t,
                subtype: st,
                payload: payload.to_vec(),
            });
        };
        let (peer, ready) = self.get_or_handshake_no_routing(vpn_ip, Some(&cache_packet));

        let Some(peer) = peer else {
            debug!(%vpn_ip, "dropping message, address not inside the mesh");
            return;
        };
        if !ready {
            return;
        }

        self.send(t, st, &peer, payload, nb, out);
    }

    /// Replay one deferred packet after its peer's handshake completed.
    ///
    /// The firewall is re-checked: rules may have changed while the packet
    /// was parked. No conntrack cache applies here.
    pub fn send_message_now(
        &self,
        t: MessageType,
        st: MessageSubType,
        peer: &Peer,
        payload: &[u8],
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
    ) {
        let mut fw = FlowPacket::default();
        if let Err(e) = packet::parse(payload, false, &mut fw) {
            warn!("error parsing deferred packet for firewall check: {e}");
            return;
        }

        if let Some(reason) = self.firewall.drop_reason(&fw, false, peer, None) {
            debug!(remote = %fw.remote_ip, %reason, "dropping deferred packet");
            return;
        }

        self.send_inner(MessageType::Message, st, peer, None, payload, nb, out, 0);
    }

    /// Send to a peer's best-known address
    pub fn send(
        &self,
        t: MessageType,
        st: MessageSubType,
        peer: &Peer,
        payload: &[u8],
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
    ) {
        self.send_inner(t, st, peer, None, payload, nb, out, 0);
    }

    /// Send to an explicit address, bypassing the peer's known remote
    pub fn send_to(
        &self,
        t: MessageType,
        st: MessageSubType,
        peer: &Peer,
        remote: SocketAddr,
        payload: &[u8],
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
    ) {
        self.send_inner(t, st, peer, Some(remote), payload, nb, out, 0);
    }

    /// The emitter. Encodes the header, seals the payload on a fresh counter,
    /// and routes the frame: explicit remote, then the peer's last-known
    /// address, then the relay fallback.
    #[allow(clippy::too_many_arguments)]
    fn send_inner(
        &self,
        t: MessageType,
        st: MessageSubType,
        peer: &Peer,
        remote: Option<SocketAddr>,
        payload: &[u8],
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
        q: usize,
    ) {
        let Some(cipher) = peer.session.cipher() else {
            debug!(peer = %peer.vpn_ip, "dropping packet, session has no encryption key");
            return;
        };

        let peer_remote = peer.remote();
        let use_relay = remote.is_none() && peer_remote.is_none();

        out.clear();
        let region = if use_relay {
            // Reserve room at the front for the outer relay header
            out.resize(HEADER_LEN, 0);
            HEADER_LEN
        } else {
            0
        };

        let counter;
        let sealed = {
            // Some ciphers check nonce uniqueness across the counter read and
            // the seal; hold the session write lock for exactly that span
            let _guard = cipher
                .encrypt_lock_needed()
                .then(|| peer.session.lock_write());
            counter = peer.session.next_counter();

            header::encode_into(out, t, st, peer.remote_index(), counter);
            self.connection_manager.out(peer.local_index);

            if t != MessageType::CloseTunnel {
                self.maybe_requery_lighthouse(peer);
            }

            out.extend_from_slice(payload);
            cipher.seal_in_place(out, region, HEADER_LEN, counter, nb)
        };
        if let Err(e) = sealed {
            error!(peer = %peer.vpn_ip, counter, "failed to encrypt outgoing packet: {e}");
            return;
        }

        if let Some(addr) = remote {
            if let Err(e) = self.writers[q].write_to(out, addr) {
                error!(peer = %peer.vpn_ip, %addr, "failed to write outgoing packet: {e}");
            }
        } else if let Some(addr) = peer_remote {
            if let Err(e) = self.writers[q].write_to(out, addr) {
                error!(peer = %peer.vpn_ip, %addr, "failed to write outgoing packet: {e}");
            }
        } else {
            for relay_ip in peer.relay_state.copy_relay_ips() {
                match self.hostmap.query_relay_for(peer.vpn_ip, relay_ip) {
                    Ok((via, relay)) => {
                        self.send_via_prepared(&via, &relay, nb, out);
                        break;
                    }
                    Err(e) => {
                        peer.relay_state.remove_relay(relay_ip);
                        info!(peer = %peer.vpn_ip, relay = %relay_ip, "relay lookup failed, evicting: {e}");
                    }
                }
            }
        }
    }

    /// Forward a payload through a relay peer.
    ///
    /// The payload is authenticated, not encrypted: it is either an inner
    /// frame that is already end-to-end encrypted by the originator, or a
    /// handshake message that must stay readable. The tag proves transport
    /// integrity between this node and the relay.
    pub fn send_via(
        &self,
        via: &Peer,
        relay: &Relay,
        ad: &[u8],
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
    ) {
        let Some(cipher) = via.session.cipher() else {
            debug!(relay = %via.vpn_ip, "dropping relay frame, relay session has no encryption key");
            return;
        };
        if HEADER_LEN + ad.len() + cipher.overhead() > self.out_cap {
            error!(
                payload_len = ad.len(),
                cap = self.out_cap,
                "out buffer not large enough for relay"
            );
            return;
        }

        out.clear();
        out.resize(HEADER_LEN, 0);
        out.extend_from_slice(ad);
        self.send_via_prepared(via, relay, nb, out);
    }

    /// Relay forwarding over a frame whose first [`HEADER_LEN`] bytes were
    /// reserved for the outer header and whose associated data is in place
    fn send_via_prepared(
        &self,
        via: &Peer,
        relay: &Relay,
        nb: &mut [u8; NONCE_SIZE],
        out: &mut Vec<u8>,
    ) {
        let Some(cipher) = via.session.cipher() else {
            debug!(relay = %via.vpn_ip, "dropping relay frame, relay session has no encryption key");
            return;
        };

        let counter;
        let sealed = {
            let _guard = cipher
                .encrypt_lock_needed()
                .then(|| via.session.lock_write());
            counter = via.session.next_counter();

            header::encode_at(
                &mut out[..HEADER_LEN],
                MessageType::Message,
                MessageSubType::Relay,
                relay.remote_index,
                counter,
            );
            self.connection_manager.out(via.local_index);

            if out.len() + cipher.overhead() > self.out_cap {
                error!(
                    len = out.len(),
                    cap = self.out_cap,
                    "out buffer not large enough for relay"
                );
                return;
            }

            cipher.seal_in_place(out, 0, out.len(), counter, nb)
        };
        if let Err(e) = sealed {
            info!(relay = %via.vpn_ip, counter, "failed to seal relay frame: {e}");
            return;
        }

        let Some(addr) = via.remote() else {
            error!(relay = %via.vpn_ip, "relay peer has no remote address");
            return;
        };
        if let Err(e) = self.writers[0].write_to(out, addr) {
            info!(relay = %via.vpn_ip, "failed to write relay frame: {e}");
        }
        self.connection_manager.relay_used(relay.local_index);
    }

    /// Re-query the lighthouse once per socket rebind per peer, so an idle
    /// address change still converges quickly when traffic resumes
    fn maybe_requery_lighthouse(&self, peer: &Peer) {
        let rebind = self.rebind_count.load(Ordering::Relaxed) & self.rebind_mask;
        if peer.last_rebind() != rebind {
            // A tunnel idle across exactly one full counter cycle misses this
            // query; the liveness path eventually tears such tunnels down
            self.lighthouse.query_server(peer.vpn_ip);
            peer.set_last_rebind(rebind);
            debug!(peer = %peer.vpn_ip, "lighthouse re-query triggered by rebind counter");
        }
    }
}
