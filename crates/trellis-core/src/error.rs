//! Core datapath errors
//!
//! The datapath entry points absorb their own failures (log and drop), so
//! these errors surface only from wiring and from host-map lookups.

use std::net::IpAddr;

use thiserror::Error;

/// Core datapath errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// No established peer for an address
    #[error("Peer not found: {0}")]
    PeerNotFound(IpAddr),

    /// A relay id was present on the peer but no tunnel exists through it
    #[error("No relay through {relay} established for {target}")]
    RelayNotEstablished { target: IpAddr, relay: IpAddr },

    /// Completion arrived for an address nothing is pending on
    #[error("No pending handshake for {0}")]
    NotPending(IpAddr),

    /// Invalid wiring or configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Net(#[from] trellis_net::NetError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] trellis_crypto::CryptoError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
