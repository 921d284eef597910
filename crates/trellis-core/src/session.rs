//! Peer sessions
//!
//! A `Peer` is the datapath's view of another node: its session cipher and
//! counter, its last-known real address, and the relay ids that can reach it
//! when no direct address works. Peers live in the host map and are borrowed
//! read-mostly; only the counter, the optional write lock and the relay list
//! see mutation on the hot path.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard, RwLock};

use trellis_crypto::SessionCipher;

/// Per-session encryption state.
///
/// The counter is strictly monotone: every send takes a fresh value via one
/// atomic increment, and that value becomes the AEAD nonce. The write lock is
/// taken only when the installed cipher demands serialized sends.
pub struct Session {
    cipher: OnceLock<SessionCipher>,
    counter: AtomicU64,
    write_lock: Mutex<()>,
}

impl Session {
    /// A fresh session in the NoKey state
    pub fn new() -> Self {
        Self {
            cipher: OnceLock::new(),
            counter: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Install the session cipher, transitioning NoKey -> Keyed.
    ///
    /// Returns false if a cipher was already installed; the original wins.
    pub fn install_cipher(&self, cipher: SessionCipher) -> bool {
        self.cipher.set(cipher).is_ok()
    }

    /// The installed cipher, if the session is keyed
    pub fn cipher(&self) -> Option<&SessionCipher> {
        self.cipher.get()
    }

    /// Whether a key has been installed
    pub fn is_keyed(&self) -> bool {
        self.cipher.get().is_some()
    }

    /// Take the next message counter (1, 2, 3, ...)
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last counter handed out
    pub fn current_counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Serialize sends for ciphers that require it
    pub fn lock_write(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// An established relay tunnel descriptor through some peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relay {
    /// Our index for this relay tunnel
    pub local_index: u32,
    /// The relay's index, carried in the outer wire header
    pub remote_index: u32,
    /// The ultimate target this relay can reach
    pub peer_ip: IpAddr,
}

/// The relay ids known to reach a peer
#[derive(Default)]
pub struct RelayState {
    relay_ips: RwLock<Vec<IpAddr>>,
}

impl RelayState {
    /// Snapshot the relay list for iteration outside the lock
    pub fn copy_relay_ips(&self) -> Vec<IpAddr> {
        self.relay_ips.read().clone()
    }

    /// Add a relay id if not already present
    pub fn add_relay(&self, ip: IpAddr) {
        let mut ips = self.relay_ips.write();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    /// Evict a relay id that failed to resolve
    pub fn remove_relay(&self, ip: IpAddr) {
        self.relay_ips.write().retain(|r| *r != ip);
    }
}

/// The datapath's handle on another node
pub struct Peer {
    /// Mesh address of the peer
    pub vpn_ip: IpAddr,
    /// Our index for this peer, used for connection accounting
    pub local_index: u32,
    /// Peer session state
    pub session: Session,
    /// Relay ids that can reach this peer
    pub relay_state: RelayState,

    remote_index: AtomicU32,
    remote: RwLock<Option<SocketAddr>>,
    last_rebind: AtomicU64,
}

impl Peer {
    /// Create a peer in the NoKey state
    pub fn new(vpn_ip: IpAddr, local_index: u32) -> Self {
        Self {
            vpn_ip,
            local_index,
            session: Session::new(),
            relay_state: RelayState::default(),
            remote_index: AtomicU32::new(0),
            remote: RwLock::new(None),
            last_rebind: AtomicU64::new(0),
        }
    }

    /// The peer's index, carried in outbound wire headers
    pub fn remote_index(&self) -> u32 {
        self.remote_index.load(Ordering::Relaxed)
    }

    /// Record the peer's index at handshake completion
    pub fn set_remote_index(&self, index: u32) {
        self.remote_index.store(index, Ordering::Relaxed);
    }

    /// Last-known real address, if any
    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.read()
    }

    /// Update the last-known real address
    pub fn set_remote(&self, addr: Option<SocketAddr>) {
        *self.remote.write() = addr;
    }

    /// Rebind counter value observed at the last send
    pub fn last_rebind(&self) -> u64 {
        self.last_rebind.load(Ordering::Relaxed)
    }

    /// Record the rebind counter after a lighthouse re-query
    pub fn set_last_rebind(&self, count: u64) {
        self.last_rebind.store(count, Ordering::Relaxed);
    }
}
