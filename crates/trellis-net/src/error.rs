//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet is shorter than its headers claim
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    /// Neither IPv4 nor IPv6
    #[error("Unknown IP version: {0}")]
    UnknownIpVersion(u8),

    /// IPv4 IHL below the 20-byte minimum
    #[error("Invalid IPv4 header length: {0}")]
    InvalidHeaderLength(usize),

    /// IPv6 extension chain too deep to be plausible
    #[error("IPv6 extension header chain too long")]
    ExtensionChainTooLong,

    /// Wire header type nibble out of range
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Wire header subtype out of range
    #[error("Unknown message subtype: {0}")]
    UnknownMessageSubType(u8),

    /// Wire header version mismatch
    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
