//! UDP writer over a standard socket

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::device::PacketWriter;

/// A [`PacketWriter`] backed by a bound `UdpSocket`.
///
/// Sockets are cheap to clone per worker; the kernel serializes sends.
#[derive(Clone)]
pub struct UdpWriter {
    socket: Arc<UdpSocket>,
}

impl UdpWriter {
    /// Bind a new socket for sending
    pub fn bind(listen: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(listen)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Wrap an already-bound socket
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    /// The local address this writer sends from
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl PacketWriter for UdpWriter {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(data, addr).map(|_| ())
    }
}
