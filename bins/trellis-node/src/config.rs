//! Node configuration file

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use trellis_core::DatapathConfig;
use trellis_net::{Gateway, IpNetwork, RouteTable};

/// Top-level node configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,

    #[serde(default)]
    pub datapath: DatapathConfig,

    #[serde(default, rename = "route")]
    pub routes: Vec<RouteSection>,
}

/// Identity and sockets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Our VPN address and prefix, e.g. "10.42.0.1/24"
    pub cidr: String,

    /// UDP listen address
    pub listen: SocketAddr,

    /// Device MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

fn default_mtu() -> usize {
    1300
}

/// One static route to gateways inside the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSection {
    /// Destination prefix, e.g. "172.20.0.0/16"
    pub prefix: String,

    /// Ordered gateway list; more than one enables ECMP balancing
    pub gateways: Vec<GatewaySection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    pub ip: IpAddr,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl NodeConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        config
            .datapath
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid [datapath] section")?;
        for route in &config.routes {
            if route.gateways.is_empty() {
                bail!("route {} has no gateways", route.prefix);
            }
            if route.gateways.iter().any(|g| g.weight == 0) {
                bail!("route {} has a zero-weight gateway", route.prefix);
            }
        }

        Ok(config)
    }

    /// The node's VPN prefix
    pub fn vpn_network(&self) -> Result<IpNetwork> {
        parse_cidr(&self.node.cidr)
    }

    /// Build the static route table from the `[[route]]` sections
    pub fn route_table(&self) -> Result<RouteTable> {
        let mut table = RouteTable::new();
        for route in &self.routes {
            let network = parse_cidr(&route.prefix)
                .with_context(|| format!("route prefix {}", route.prefix))?;
            let gateways = route
                .gateways
                .iter()
                .map(|g| Gateway::new(g.ip, g.weight))
                .collect();
            table.insert(network, gateways);
        }
        Ok(table)
    }
}

/// Parse "address/prefix" notation
pub fn parse_cidr(s: &str) -> Result<IpNetwork> {
    let (addr, prefix) = s
        .split_once('/')
        .with_context(|| format!("{s}: expected address/prefix"))?;
    let address: IpAddr = addr
        .parse()
        .with_context(|| format!("{s}: bad address"))?;
    let prefix_len: u8 = prefix
        .parse()
        .with_context(|| format!("{s}: bad prefix length"))?;

    let max = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix_len > max {
        bail!("{s}: prefix length {prefix_len} exceeds {max}");
    }
    Ok(IpNetwork::new(address, prefix_len))
}
