//! Trellis Cryptographic Primitives
//!
//! Session-level authenticated encryption for the trellis datapath:
//! - ChaCha20-Poly1305 and AES-256-GCM AEAD ciphers
//! - Counter-derived nonces written into reusable scratch buffers
//! - In-place seal with associated-data-only mode for relay framing

pub mod cipher;
pub mod error;

pub use cipher::{CipherKind, SessionCipher, SessionKey};
pub use error::{CryptoError, CryptoResult};

/// Session key size in bytes (both supported ciphers use 256-bit keys)
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AEAD authentication tag size in bytes
pub const TAG_SIZE: usize = 16;
