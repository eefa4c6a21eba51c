//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid peer public key: {0}")]
    InvalidPeerKey(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
}
