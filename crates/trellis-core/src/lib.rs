//! Trellis Outbound Datapath Core
//!
//! Takes IP packets emerging from the local virtual device and decides
//! whether to drop, forward, handshake-and-queue, balance across equal-cost
//! gateways, encrypt-and-send, or relay through an intermediate peer:
//! - Inside-to-outside admission, classification and routing
//! - Cooperative handshake gating with per-peer pending queues
//! - Authenticated-encrypted emission with monotonic session counters
//! - Double-wrapped relay fallback when no direct address is known
//! - Reject synthesis (TCP RST / ICMP prohibited) under firewall policy

pub mod config;
pub mod connmgr;
pub mod error;
pub mod firewall;
pub mod hostmap;
pub mod interface;
pub mod lighthouse;
pub mod pending;
pub mod session;
pub mod worker;

pub use config::DatapathConfig;
pub use connmgr::{ConnCounters, ConnectionManager};
pub use error::{CoreError, CoreResult};
pub use firewall::{ConntrackCache, DropReason, Firewall};
pub use hostmap::HostMap;
pub use interface::{Interface, InterfaceConfig, Resolution};
pub use lighthouse::Lighthouse;
pub use pending::{CachedPacket, HandshakeManager, PacketQueue, PendingSlot};
pub use session::{Peer, Relay, RelayState, Session};
pub use worker::run_workers;
