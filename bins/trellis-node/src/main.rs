//! Trellis Node
//!
//! Wires the outbound datapath to its collaborators: loads config, sets up
//! logging, binds the UDP writers and runs the workers. The virtual device
//! used here is a stand-in that serves the configured static routes; a real
//! deployment plugs a platform TUN driver into the same seam.

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, trace, Level};
use tracing_subscriber::FmtSubscriber;

use trellis_core::firewall::AllowAll;
use trellis_core::lighthouse::NoopLighthouse;
use trellis_core::{
    interface::platform_forwards_to_self, run_workers, ConnectionManager, HandshakeManager,
    HostMap, Interface, InterfaceConfig,
};
use trellis_net::{Device, Gateway, IpNetwork, PacketWriter, RouteTable, UdpWriter};

mod config;

use config::NodeConfig;

/// Trellis - overlay mesh VPN node
#[derive(Parser)]
#[command(name = "trellis-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until stdin closes
    Run,

    /// Parse and print the configuration, then exit
    CheckConfig,
}

/// A device with no traffic source: static routes from config, writes logged.
/// Stands in for the platform TUN driver behind the same trait.
struct StaticRouteDevice {
    cidr: IpNetwork,
    routes: RouteTable,
    queues: usize,
}

impl Device for StaticRouteDevice {
    fn name(&self) -> &str {
        "trellis0"
    }

    fn cidr(&self) -> IpNetwork {
        self.cidr
    }

    fn routes_for(&self, dest: IpAddr) -> Vec<Gateway> {
        self.routes.lookup(dest).to_vec()
    }

    fn read(&self, _q: usize, _buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_millis(50));
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn write(&self, q: usize, packet: &[u8]) -> io::Result<usize> {
        trace!(queue = q, len = packet.len(), "device write");
        Ok(packet.len())
    }

    fn queue_count(&self) -> usize {
        self.queues
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = NodeConfig::load(&cli.config)?;

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run => run(config),
    }
}

fn run(config: NodeConfig) -> Result<()> {
    let vpn_net = config.vpn_network()?;
    info!(cidr = %config.node.cidr, listen = %config.node.listen, "starting node");

    let device = Arc::new(StaticRouteDevice {
        cidr: vpn_net,
        routes: config.route_table()?,
        queues: config.datapath.routines,
    });

    let writer = Arc::new(UdpWriter::bind(config.node.listen).context("binding UDP socket")?);
    info!(local = %writer.local_addr()?, "UDP writer bound");
    let writers: Vec<Arc<dyn PacketWriter>> = (0..config.datapath.routines)
        .map(|_| writer.clone() as Arc<dyn PacketWriter>)
        .collect();

    let hostmap = Arc::new(HostMap::new());
    let lighthouse = Arc::new(NoopLighthouse);
    let handshake_manager = Arc::new(HandshakeManager::new(
        hostmap.clone(),
        lighthouse.clone(),
        config.datapath.pending_queue_size,
    ));

    let iface = Interface::new(InterfaceConfig {
        device,
        writers,
        firewall: Arc::new(AllowAll),
        hostmap,
        handshake_manager,
        lighthouse,
        connection_manager: Arc::new(ConnectionManager::new()),
        config: config.datapath.clone(),
        mtu: config.node.mtu,
        forward_self_through_tun: platform_forwards_to_self(),
    })?;

    let handles = run_workers(&iface).context("spawning workers")?;
    info!(routines = config.datapath.routines, "workers running; close stdin to stop");

    // Block until stdin closes, then wind down
    for line in io::stdin().lock().lines() {
        if line.is_err() {
            break;
        }
    }

    info!("shutting down");
    iface.shutdown();
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}
