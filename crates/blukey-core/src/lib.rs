//! BluKey core protocol logic.
//!
//! Sans-IO implementation of the dongle's secure session protocol:
//!
//! - **Provisioning**: the one-time challenge/response exchange that
//!   issues the 32-byte APPKEY from a user password
//!   ([`provision`])
//! - **Handshake**: per-connection P-256 ECDH key agreement
//!   authenticated by the APPKEY, producing a [`Session`]
//!   ([`handshake`])
//! - **Secure channel**: AES-CTR + truncated-HMAC wrapping of
//!   application frames over the `0xB3` transport opcode
//!   ([`secure`])
//!
//! Nothing here performs IO; the `blukey-client` crate drives these
//! state machines over a transport.

pub mod error;
pub mod handshake;
pub mod provision;
pub mod secure;
pub mod tracing_init;

pub use error::{Error, Result};
pub use handshake::{Handshake, ServerHello, derive_session_keys, server_finish_mac};
pub use provision::{Challenge, PasswordMaterial, map_device_error, unwrap_app_key};
pub use secure::{DIR_CLIENT, DIR_SERVER, Session, SessionKeys, open_b3, seal_b3};
