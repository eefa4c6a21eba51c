//! Opcode registry for the dongle protocol.
//!
//! Outer (transport-level) opcodes all have the high bit set, which the
//! framer relies on when resynchronizing after corruption. Inner
//! opcodes travel only inside the encrypted `0xB3` channel.

/// Generic empty ACK (inner reply to `SET_LAYOUT` / `ENABLE_FAST_KEYS`).
pub const ACK: u8 = 0x00;

/// Provisioning: request a fresh challenge.
pub const PROV_REQUEST: u8 = 0xA0;
/// Provisioning: key response, 32 bytes direct or 48 bytes wrapped.
pub const PROV_KEY: u8 = 0xA1;
/// Provisioning: challenge, `salt(16) || iters_le32(4) || challenge(16)`.
pub const PROV_CHALLENGE: u8 = 0xA2;
/// Provisioning: password proof, 32 bytes.
pub const PROV_PROOF: u8 = 0xA3;

/// Handshake: server hello, `srv_pub(65) || sid_be32(4)`.
pub const SERVER_HELLO: u8 = 0xB0;
/// Handshake: client hello, `cli_pub(65) || mac16(16)`.
pub const CLIENT_HELLO: u8 = 0xB1;
/// Handshake: server finish MAC, 16 bytes.
pub const SERVER_FINISH: u8 = 0xB2;
/// Established channel: authenticated-encrypted frame.
pub const SECURE: u8 = 0xB3;

/// Error frame; payload is a UTF-8 status token.
pub const ERROR: u8 = 0xFF;

// Inner application opcodes (inside the secure channel).

/// Set keyboard layout (UTF-8 layout code), expects [`ACK`].
pub const SET_LAYOUT: u8 = 0xC0;
/// Request current layout.
pub const GET_LAYOUT: u8 = 0xC1;
/// Layout reply; UTF-8 text containing a `LAYOUT=<CODE>` token.
pub const LAYOUT_REPLY: u8 = 0xC2;
/// Enable raw-key (fast keys) mode for this session, expects [`ACK`].
pub const ENABLE_FAST_KEYS: u8 = 0xC8;

/// Send a text string for the dongle to type.
pub const SEND_TEXT: u8 = 0xD0;
/// Text hash ack: MD5 of the received text, optionally status-prefixed.
pub const TEXT_HASH_ACK: u8 = 0xD1;

/// Raw HID key tap: `mods(1) || usage(1) [|| repeat(1)]`.
pub const RAW_KEY_TAP: u8 = 0xE0;
