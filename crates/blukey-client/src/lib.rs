//! BluKey async client.
//!
//! Drives the `blukey-core` protocol state machines over a pluggable
//! BLE transport. The three platform seams — the transport itself, the
//! APPKEY secret store, and the provisioning password prompt — are
//! traits implemented by the embedding application ([`traits`]).
//!
//! All protocol state lives inside a single actor task: commands are
//! queued and executed strictly one at a time ([`BluKeyClient`]), and
//! inbound frames are routed through a single-waiter demultiplexer
//! ([`router::RxRouter`]). This serialization is what makes the
//! single RX waiter slot sound.

pub mod config;
pub mod hub;
pub mod router;
pub mod traits;

pub use blukey_core::{Error, Result};
pub use config::ClientConfig;
pub use hub::BluKeyClient;
pub use traits::{PasswordPrompt, SecretStore, Transport};
