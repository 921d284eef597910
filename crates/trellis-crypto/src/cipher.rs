//! Session AEAD ciphers
//!
//! A session cipher seals outbound frames in place: the wire header acts as
//! associated data, the payload is encrypted where it sits, and the 16-byte
//! tag is appended. Relay framing uses the same entry point with an empty
//! plaintext region, which authenticates the buffer without encrypting it.

use std::sync::atomic::AtomicU64;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, NONCE_SIZE};

/// Supported AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// ChaCha20-Poly1305 (default)
    ChaCha20Poly1305,
    /// AES-256-GCM; sends are serialized for the nonce uniqueness check
    Aes256Gcm,
}

/// A 256-bit session key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

/// Write the nonce for a message counter into a reusable scratch buffer.
///
/// The counter occupies the low (last) eight bytes, big-endian; the prefix is
/// zero.
pub fn counter_nonce(counter: u64, nonce_buf: &mut [u8; NONCE_SIZE]) {
    nonce_buf[..4].fill(0);
    nonce_buf[4..].copy_from_slice(&counter.to_be_bytes());
}

/// An established session's AEAD cipher
pub enum SessionCipher {
    /// ChaCha20-Poly1305 session
    ChaCha20Poly1305(ChaCha20Poly1305),
    /// AES-256-GCM session
    Aes256Gcm {
        cipher: Aes256Gcm,
        /// Last counter sealed, tracked in debug builds to catch nonce reuse
        last_counter: AtomicU64,
    },
}

impl SessionCipher {
    /// Build a cipher for the given algorithm from a session key
    pub fn new(kind: CipherKind, key: &SessionKey) -> Self {
        match kind {
            CipherKind::ChaCha20Poly1305 => {
                Self::ChaCha20Poly1305(ChaCha20Poly1305::new(key.as_bytes().into()))
            }
            CipherKind::Aes256Gcm => Self::Aes256Gcm {
                cipher: Aes256Gcm::new(key.as_bytes().into()),
                last_counter: AtomicU64::new(0),
            },
        }
    }

    /// Which algorithm this session uses
    pub fn kind(&self) -> CipherKind {
        match self {
            Self::ChaCha20Poly1305(_) => CipherKind::ChaCha20Poly1305,
            Self::Aes256Gcm { .. } => CipherKind::Aes256Gcm,
        }
    }

    /// Bytes added to a sealed frame (the authentication tag)
    pub fn overhead(&self) -> usize {
        crate::TAG_SIZE
    }

    /// Whether concurrent sends through this cipher must be serialized.
    ///
    /// AES-GCM sessions check nonce uniqueness across the counter read and the
    /// seal, so the caller must hold the session write lock for that span.
    pub fn encrypt_lock_needed(&self) -> bool {
        matches!(self, Self::Aes256Gcm { .. })
    }

    /// Seal `out[region..]` in place.
    ///
    /// The first `aad_len` bytes of the region are authenticated but not
    /// encrypted; the remainder is encrypted where it sits. The tag is
    /// appended to `out`. An empty plaintext region authenticates only.
    pub fn seal_in_place(
        &self,
        out: &mut Vec<u8>,
        region: usize,
        aad_len: usize,
        counter: u64,
        nonce_buf: &mut [u8; NONCE_SIZE],
    ) -> CryptoResult<()> {
        let region_len = out.len().saturating_sub(region);
        if region > out.len() || aad_len > region_len {
            return Err(CryptoError::InvalidSealRegion { aad_len, region_len });
        }

        counter_nonce(counter, nonce_buf);

        let tag = {
            let frame = &mut out[region..];
            let (aad, body) = frame.split_at_mut(aad_len);
            match self {
                Self::ChaCha20Poly1305(cipher) => cipher.encrypt_in_place_detached(
                    chacha20poly1305::Nonce::from_slice(&nonce_buf[..]),
                    aad,
                    body,
                ),
                Self::Aes256Gcm {
                    cipher,
                    last_counter,
                } => {
                    #[cfg(debug_assertions)]
                    {
                        let prev =
                            last_counter.swap(counter, std::sync::atomic::Ordering::Relaxed);
                        debug_assert!(
                            counter > prev,
                            "AEAD counter not monotone: {counter} after {prev}"
                        );
                    }
                    #[cfg(not(debug_assertions))]
                    let _ = last_counter;
                    cipher.encrypt_in_place_detached(
                        aes_gcm::Nonce::from_slice(&nonce_buf[..]),
                        aad,
                        body,
                    )
                }
            }
            .map_err(|_| CryptoError::EncryptionFailed)?
        };

        out.extend_from_slice(&tag);
        Ok(())
    }
}
