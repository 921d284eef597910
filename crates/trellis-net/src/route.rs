//! Gateway routing and ECMP balancing
//!
//! Multi-gateway routes are balanced with hash-threshold mapping, the same
//! scheme the Linux kernel uses for ECMP nexthop selection: a 31-bit flow
//! fingerprint picks the first gateway whose cumulative-weight threshold it
//! does not exceed. Stability under weight changes is deliberately weak, but
//! operators can reason about it exactly as they do for kernel routes.

use std::net::IpAddr;

use xxhash_rust::xxh3::xxh3_64;

use crate::packet::FlowPacket;

/// An address prefix in CIDR form.
///
/// Keeps the declared address alongside the prefix length: a node configured
/// as "10.42.0.1/24" needs both the .1 and the /24. Host bits are not masked
/// off at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    pub address: IpAddr,
    pub prefix_len: u8,
}

/// Widen an address to 128 bits plus its native width. IPv4 occupies the
/// high 32 bits so prefix agreement can be counted from the top for both
/// families.
fn address_bits(ip: IpAddr) -> (u128, u8) {
    match ip {
        IpAddr::V4(v4) => (u128::from(u32::from(v4)) << 96, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

impl IpNetwork {
    /// Create a network from its declared address and prefix length
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Whether `ip` lies within this prefix.
    ///
    /// An address of the other family never matches, a /0 matches its whole
    /// family.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let (net, width) = address_bits(self.address);
        let (addr, addr_width) = address_bits(ip);
        if width != addr_width {
            return false;
        }
        (net ^ addr).leading_zeros() >= u32::from(self.prefix_len.min(width))
    }

    /// Directed broadcast address, for IPv4 networks
    pub fn broadcast(&self) -> Option<IpAddr> {
        match self.address {
            IpAddr::V4(v4) if self.prefix_len < 32 => {
                let raw = u32::from(v4) | (u32::MAX >> self.prefix_len);
                Some(IpAddr::V4(raw.into()))
            }
            _ => None,
        }
    }
}

/// A route gateway with its hash-threshold bucket bound.
///
/// `upper_bound` is undefined until the owning set has been through
/// [`rebalance_gateways`]; route tables rebalance on load so selection never
/// observes the unset value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gateway {
    ip: IpAddr,
    weight: u32,
    upper_bound: u32,
}

impl Gateway {
    /// Create a gateway with the given priority weight (must be positive)
    pub fn new(ip: IpAddr, weight: u32) -> Self {
        Self {
            ip,
            weight,
            upper_bound: 0,
        }
    }

    /// Gateway address
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Priority weight
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Hash-threshold bucket bound, valid after rebalancing
    pub fn upper_bound(&self) -> u32 {
        self.upper_bound
    }
}

/// Divide and round to nearest integer
fn div_and_round(v: u64, d: u64) -> u64 {
    (v + d / 2) / d
}

/// Recompute hash-threshold bucket bounds in place.
///
/// Follows the same algorithm as the Linux kernel: walking the gateways in
/// declared order, bucket `i` ends at `round(cum_i * 2^31 / W) - 1`. For any
/// positive total weight the final bound is exactly `2^31 - 1`, so every
/// 31-bit hash lands in some bucket.
pub fn rebalance_gateways(gateways: &mut [Gateway]) {
    let total_weight: u64 = gateways.iter().map(|g| u64::from(g.weight)).sum();
    if total_weight == 0 {
        return;
    }

    let mut loop_weight: u64 = 0;
    for gw in gateways.iter_mut() {
        loop_weight += u64::from(gw.weight);
        gw.upper_bound = div_and_round(loop_weight << 31, total_weight).saturating_sub(1) as u32;
    }
}

/// Fingerprint a flow for gateway selection.
///
/// XXH3-64 over local ip bytes, remote ip bytes, then both ports
/// little-endian and the protocol, masked to 31 bits.
pub fn hash_flow(fw: &FlowPacket) -> u32 {
    let mut buf = [0u8; 37];
    let mut len = 0usize;

    for ip in [fw.local_ip, fw.remote_ip] {
        match ip {
            IpAddr::V4(v4) => {
                buf[len..len + 4].copy_from_slice(&v4.octets());
                len += 4;
            }
            IpAddr::V6(v6) => {
                buf[len..len + 16].copy_from_slice(&v6.octets());
                len += 16;
            }
        }
    }

    buf[len] = (fw.local_port & 0xFF) as u8;
    buf[len + 1] = (fw.local_port >> 8) as u8;
    buf[len + 2] = (fw.remote_port & 0xFF) as u8;
    buf[len + 3] = (fw.remote_port >> 8) as u8;
    buf[len + 4] = fw.protocol;
    len += 5;

    (xxh3_64(&buf[..len]) & 0x7FFF_FFFF) as u32
}

/// Select a gateway for a flow from a rebalanced set.
///
/// # Panics
///
/// Panics if the hash falls outside every bucket. That can only happen when
/// the set was never rebalanced, which is a programming error in route-table
/// loading, not a runtime condition.
pub fn select_gateway(fw: &FlowPacket, gateways: &[Gateway]) -> IpAddr {
    let hash = hash_flow(fw);

    for gw in gateways {
        if hash <= gw.upper_bound {
            return gw.ip;
        }
    }

    panic!("flow hash must always fall inside a gateway bucket");
}

/// Static route table mapping destination prefixes to ordered gateway sets.
///
/// Longest prefix wins; ties resolve to the earliest insertion. Gateways are
/// rebalanced once at insertion, never per packet.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<(IpNetwork, Vec<Gateway>)>,
}

impl RouteTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route; its gateway set is rebalanced in place
    pub fn insert(&mut self, network: IpNetwork, mut gateways: Vec<Gateway>) {
        rebalance_gateways(&mut gateways);
        let pos = self
            .routes
            .iter()
            .position(|(net, _)| net.prefix_len < network.prefix_len)
            .unwrap_or(self.routes.len());
        self.routes.insert(pos, (network, gateways));
    }

    /// Gateways for a destination, or an empty slice when unroutable
    pub fn lookup(&self, dest: IpAddr) -> &[Gateway] {
        self.routes
            .iter()
            .find(|(net, _)| net.contains(dest))
            .map(|(_, gws)| gws.as_slice())
            .unwrap_or(&[])
    }

    /// Number of configured routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
