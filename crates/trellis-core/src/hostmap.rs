//! Established peer map
//!
//! Reader-mostly: workers look peers up on every packet, writes happen only
//! at handshake completion and relay registration.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::session::{Peer, Relay};

/// Map of established peers plus the relay tunnels registered for them
#[derive(Default)]
pub struct HostMap {
    peers: RwLock<HashMap<IpAddr, Arc<Peer>>>,
    // keyed by (target, relay id)
    relays: RwLock<HashMap<(IpAddr, IpAddr), Relay>>,
}

impl HostMap {
    /// Create an empty host map
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an established peer
    pub fn get(&self, vpn_ip: IpAddr) -> Option<Arc<Peer>> {
        self.peers.read().get(&vpn_ip).cloned()
    }

    /// Publish a peer (at handshake completion)
    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().insert(peer.vpn_ip, peer);
    }

    /// Remove a peer and any relay tunnels targeting it
    pub fn remove(&self, vpn_ip: IpAddr) -> Option<Arc<Peer>> {
        self.relays.write().retain(|(target, _), _| *target != vpn_ip);
        self.peers.write().remove(&vpn_ip)
    }

    /// Number of established peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether any peers are established
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Register a relay tunnel that reaches `target` through `relay_ip`
    pub fn add_relay_path(&self, target: IpAddr, relay_ip: IpAddr, relay: Relay) {
        self.relays.write().insert((target, relay_ip), relay);
    }

    /// Resolve a relay id on a peer to the relay peer and tunnel descriptor.
    ///
    /// Fails when no tunnel is registered or the relay itself is not an
    /// established peer; the caller evicts the relay id and tries the next.
    pub fn query_relay_for(
        &self,
        target: IpAddr,
        relay_ip: IpAddr,
    ) -> CoreResult<(Arc<Peer>, Relay)> {
        let relay = self
            .relays
            .read()
            .get(&(target, relay_ip))
            .copied()
            .ok_or(CoreError::RelayNotEstablished {
                target,
                relay: relay_ip,
            })?;
        let peer = self
            .get(relay_ip)
            .ok_or(CoreError::PeerNotFound(relay_ip))?;
        Ok((peer, relay))
    }
}
