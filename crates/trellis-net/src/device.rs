//! Virtual device and socket seams
//!
//! The datapath consumes these as trait objects: the platform TUN driver and
//! the UDP listener live elsewhere and only their contracts matter here. The
//! device exposes multiple queues, mirrored one-to-one onto worker threads.

use std::io;
use std::net::{IpAddr, SocketAddr};

use crate::route::{Gateway, IpNetwork};

/// The virtual network device the overlay reads from and writes to
pub trait Device: Send + Sync {
    /// Device name, for logs
    fn name(&self) -> &str;

    /// The node's own VPN prefix
    fn cidr(&self) -> IpNetwork;

    /// Static route lookup: ordered gateway candidates for a destination
    /// outside the VPN prefix. Empty means unroutable.
    fn routes_for(&self, dest: IpAddr) -> Vec<Gateway>;

    /// Read one packet from queue `q` into `buf`, returning its length
    fn read(&self, q: usize, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet to queue `q`
    fn write(&self, q: usize, packet: &[u8]) -> io::Result<usize>;

    /// Number of read/write queues the device exposes
    fn queue_count(&self) -> usize {
        1
    }
}

/// An outbound UDP socket
pub trait PacketWriter: Send + Sync {
    /// Send `data` to `addr`; errors are surfaced but never retried here
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()>;
}
