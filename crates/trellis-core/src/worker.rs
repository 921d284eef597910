//! Worker scheduling
//!
//! One thread per device queue. Each worker owns its scratch: a read buffer,
//! an assembly buffer, nonce scratch, a flow-tuple slot, and its conntrack
//! cache; none of it is ever shared. Shutdown is cooperative: a worker
//! finishes the packet in hand and exits.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use trellis_crypto::NONCE_SIZE;
use trellis_net::FlowPacket;

use crate::firewall::ConntrackCache;
use crate::interface::Interface;

/// Pause before retrying a device read that would block
const READ_BACKOFF: Duration = Duration::from_millis(1);

/// Spawn one worker thread per configured routine.
///
/// Call [`Interface::shutdown`] and join the handles to stop.
pub fn run_workers(iface: &Arc<Interface>) -> io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(iface.routines());
    for q in 0..iface.routines() {
        let iface = Arc::clone(iface);
        let handle = thread::Builder::new()
            .name(format!("trellis-worker-{q}"))
            .spawn(move || worker_loop(&iface, q))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_loop(iface: &Arc<Interface>, q: usize) {
    debug!(queue = q, "worker started");

    let mut read_buf = vec![0u8; iface.mtu()];
    let mut out = iface.out_buffer();
    let mut nb = [0u8; NONCE_SIZE];
    let mut fw = FlowPacket::default();
    let mut cache = ConntrackCache::new(iface.config().conntrack_cache_timeout);

    while !iface.is_shutdown() {
        match iface.device().read(q, &mut read_buf) {
            Ok(0) => {
                // Device closed underneath us
                debug!(queue = q, "device returned EOF");
                break;
            }
            Ok(n) => {
                iface.consume_inside_packet(
                    &read_buf[..n],
                    &mut fw,
                    &mut nb,
                    &mut out,
                    q,
                    Some(&mut cache),
                );
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                thread::sleep(READ_BACKOFF);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if iface.is_shutdown() {
                    break;
                }
                error!(queue = q, "device read error: {e}");
                thread::sleep(READ_BACKOFF);
            }
        }
    }

    debug!(queue = q, "worker stopped");
}
