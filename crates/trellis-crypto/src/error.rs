//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The associated-data split point lies outside the buffer
    #[error("Invalid seal region: aad length {aad_len} exceeds region length {region_len}")]
    InvalidSealRegion { aad_len: usize, region_len: usize },
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
