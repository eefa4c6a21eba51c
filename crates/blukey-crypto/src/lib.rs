//! BluKey crypto primitives.
//!
//! The dongle firmware mandates the cipher suite, so this crate is a
//! thin, deterministic layer over the RustCrypto implementations:
//!
//! - **Key agreement**: ephemeral P-256 ECDH, uncompressed SEC1 public
//!   keys (`0x04 || x || y`, 65 bytes)
//! - **Key derivation**: HKDF-SHA256 for session keys,
//!   PBKDF2-HMAC-SHA256 for the provisioning password verifier
//! - **Authentication**: HMAC-SHA256, usually truncated to 16 bytes on
//!   the wire
//! - **Encryption**: AES-256-CTR with a big-endian counter
//! - **Integrity of typed text**: MD5 (the dongle echoes an MD5 of
//!   what it typed; not used for security)

pub mod cipher;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod kex;

pub use cipher::aes256_ctr;
pub use error::CryptoError;
pub use hash::{hmac16, hmac_sha256, md5};
pub use kdf::{hkdf_sha256, pbkdf2_sha256};
pub use kex::{EphemeralKeyPair, PUBLIC_KEY_LEN, SHARED_SECRET_LEN};
