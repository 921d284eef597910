//! Wire header
//!
//! Every trellis frame starts with a fixed 14-byte header:
//!
//! ```text
//! byte 0      version (high nibble) | message type (low nibble)
//! byte 1      message subtype
//! bytes 2-5   remote index, big-endian
//! bytes 6-13  message counter, big-endian
//! ```
//!
//! The counter doubles as the AEAD nonce, so it is never reused within a
//! session.

use crate::error::{NetError, NetResult};

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 14;

/// Current wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Message type, carried in the low nibble of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Encrypted payload traffic
    Message = 0,

    /// Handshake exchange (passthrough for this crate)
    Handshake = 1,

    /// Receive-error notification (passthrough)
    RecvError = 2,

    /// Lighthouse query/reply (passthrough)
    LightHouse = 3,

    /// Connectivity test (passthrough)
    Test = 4,

    /// Tunnel teardown notice
    CloseTunnel = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, NetError> {
        match value {
            0 => Ok(Self::Message),
            1 => Ok(Self::Handshake),
            2 => Ok(Self::RecvError),
            3 => Ok(Self::LightHouse),
            4 => Ok(Self::Test),
            5 => Ok(Self::CloseTunnel),
            _ => Err(NetError::UnknownMessageType(value)),
        }
    }
}

/// Message subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageSubType {
    /// Plain message
    None = 0,

    /// Relay-wrapped message: the body is an inner frame that stays
    /// end-to-end encrypted for the ultimate target
    Relay = 1,
}

impl TryFrom<u8> for MessageSubType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, NetError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Relay),
            _ => Err(NetError::UnknownMessageSubType(value)),
        }
    }
}

/// A decoded wire header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    pub subtype: MessageSubType,
    pub remote_index: u32,
    pub counter: u64,
}

impl Header {
    /// Decode the first [`HEADER_LEN`] bytes of a frame
    pub fn parse(data: &[u8]) -> NetResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(NetError::PacketTooShort(data.len()));
        }

        let version = data[0] >> 4;
        if version != WIRE_VERSION {
            return Err(NetError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            msg_type: MessageType::try_from(data[0] & 0x0F)?,
            subtype: MessageSubType::try_from(data[1])?,
            remote_index: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            counter: u64::from_be_bytes([
                data[6], data[7], data[8], data[9], data[10], data[11], data[12], data[13],
            ]),
        })
    }
}

/// Append an encoded header to `out`
pub fn encode_into(
    out: &mut Vec<u8>,
    msg_type: MessageType,
    subtype: MessageSubType,
    remote_index: u32,
    counter: u64,
) {
    out.push((WIRE_VERSION << 4) | (msg_type as u8));
    out.push(subtype as u8);
    out.extend_from_slice(&remote_index.to_be_bytes());
    out.extend_from_slice(&counter.to_be_bytes());
}

/// Encode a header into an already-reserved [`HEADER_LEN`] byte prefix
pub fn encode_at(
    buf: &mut [u8],
    msg_type: MessageType,
    subtype: MessageSubType,
    remote_index: u32,
    counter: u64,
) {
    buf[0] = (WIRE_VERSION << 4) | (msg_type as u8);
    buf[1] = subtype as u8;
    buf[2..6].copy_from_slice(&remote_index.to_be_bytes());
    buf[6..14].copy_from_slice(&counter.to_be_bytes());
}
