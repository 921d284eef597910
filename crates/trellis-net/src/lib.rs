//! Trellis Network Layer
//!
//! Network primitives consumed by the outbound datapath:
//! - Flow five-tuple extraction from raw IP packets
//! - The 14-byte wire header
//! - ECMP gateway tables with hash-threshold balancing
//! - Reject packet synthesis (TCP RST / ICMP administratively prohibited)
//! - Seams for the virtual device and the UDP writers

pub mod device;
pub mod error;
pub mod header;
pub mod packet;
pub mod reject;
pub mod route;
pub mod udp;

pub use device::{Device, PacketWriter};
pub use error::{NetError, NetResult};
pub use header::{Header, MessageSubType, MessageType, HEADER_LEN, WIRE_VERSION};
pub use packet::FlowPacket;
pub use reject::{create_reject_packet, MAX_REJECT_PACKET_SIZE};
pub use route::{
    hash_flow, rebalance_gateways, select_gateway, Gateway, IpNetwork, RouteTable,
};
pub use udp::UdpWriter;
