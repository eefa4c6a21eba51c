//! Error taxonomy for the protocol engine.
//!
//! Variants are deliberately coarse but distinguishable: callers need
//! to tell transport trouble from authentication failures (which may
//! warrant reprovisioning) from plain timeouts (which may warrant a
//! retry).

use thiserror::Error;

/// Result type alias using the BluKey core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for BluKey protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// BLE link trouble: connect/write failure, link dropped. Never
    /// retried automatically.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame arrived that violates the protocol (wrong length,
    /// unexpected shape) and could not be resynchronized away.
    #[error("Bad frame: {0}")]
    BadFrame(String),

    /// Cryptographic authentication failed (SFIN mismatch, rejected
    /// proof, B3 MAC mismatch). May indicate a stale APPKEY.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The peer did not answer within the budget.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The command was preempted by an explicit disconnect, or the
    /// user dismissed the provisioning password prompt.
    #[error("Operation cancelled")]
    Cancelled,

    /// The dongle reported an error frame; message already mapped to
    /// a user-facing description.
    #[error("Device error: {0}")]
    Device(String),

    /// No APPKEY is stored for this device and provisioning was not
    /// allowed for the current operation.
    #[error("Device not provisioned")]
    NotProvisioned,

    /// A secure operation was attempted without an established session.
    #[error("No secure session")]
    NotSecure,

    /// Raw key taps require fast-keys mode, which has not been enabled
    /// in this session.
    #[error("Fast keys not enabled")]
    FastKeysNotEnabled,

    /// The dongle acknowledged typed text with a different MD5 than
    /// what we sent.
    #[error("Text hash mismatch")]
    HashMismatch,

    /// A layout reply arrived without a `LAYOUT=` token.
    #[error("Layout reply carried no LAYOUT token")]
    LayoutMissing,

    #[error(transparent)]
    Crypto(#[from] blukey_crypto::CryptoError),

    #[error(transparent)]
    Frame(#[from] blukey_proto::FrameError),
}

impl Error {
    /// Whether this failure indicates the cached APPKEY no longer
    /// matches the dongle and a reprovision should be offered.
    ///
    /// The dongle reports key mismatches inconsistently across
    /// firmware revisions, so this matches known message fragments
    /// rather than a single variant.
    pub fn is_key_mismatch(&self) -> bool {
        match self {
            Self::Auth(msg) | Self::Device(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("badmac")
                    || lower.contains("bad mac")
                    || lower.contains("sfin mismatch")
                    || lower.contains("bad key")
            }
            _ => false,
        }
    }
}
