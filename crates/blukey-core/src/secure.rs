//! The secure channel: authenticated-encrypted `0xB3` frames.
//!
//! A wrapped frame carries an inner application frame
//! (`op || len_le16 || payload`) as
//! `seq_be16 || cipher_len_be16 || cipher || mac16`, where the cipher
//! is AES-256-CTR under a per-frame IV and the MAC is a truncated
//! HMAC-SHA256 binding the session id, direction, sequence number and
//! ciphertext. Client-originated frames use direction byte `'C'`,
//! dongle-originated `'S'`, so a reflected frame never authenticates.

use std::fmt;

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use blukey_crypto::{aes256_ctr, hmac_sha256, hmac16};
use blukey_proto::{FRAME_HEADER_LEN, Frame, encode_frame, opcode};

use crate::error::{Error, Result};

/// Direction byte for client-to-dongle frames.
pub const DIR_CLIENT: u8 = b'C';
/// Direction byte for dongle-to-client frames.
pub const DIR_SERVER: u8 = b'S';

const LABEL_IV: &[u8] = b"IV1";
const LABEL_MAC: &[u8] = b"ENCM";

/// The symmetric key set of an established session.
///
/// `session_key` is the HKDF output; the per-purpose keys are derived
/// from it by HMAC with fixed labels, matching the dongle firmware.
pub struct SessionKeys {
    pub session_key: Zeroizing<[u8; 32]>,
    pub k_enc: Zeroizing<[u8; 32]>,
    pub k_mac: Zeroizing<[u8; 32]>,
    pub k_iv: Zeroizing<[u8; 32]>,
}

impl SessionKeys {
    /// Expand the HKDF session key into the ENC/MAC/IVK subkeys.
    pub fn from_session_key(session_key: Zeroizing<[u8; 32]>) -> Self {
        let k_enc = Zeroizing::new(hmac_sha256(&*session_key, b"ENC"));
        let k_mac = Zeroizing::new(hmac_sha256(&*session_key, b"MAC"));
        let k_iv = Zeroizing::new(hmac_sha256(&*session_key, b"IVK"));
        Self {
            session_key,
            k_enc,
            k_mac,
            k_iv,
        }
    }
}

/// Per-frame IV: `HMAC(k_iv, "IV1" || sid_be32 || dir || seq_be16)[..16]`.
fn frame_iv(keys: &SessionKeys, sid: u32, dir: u8, seq: u16) -> [u8; 16] {
    let mut msg = Vec::with_capacity(LABEL_IV.len() + 7);
    msg.extend_from_slice(LABEL_IV);
    msg.extend_from_slice(&sid.to_be_bytes());
    msg.push(dir);
    msg.extend_from_slice(&seq.to_be_bytes());
    hmac16(&*keys.k_iv, &msg)
}

/// MAC input: `"ENCM" || sid_be32 || dir || seq_be16 || cipher`.
fn frame_mac(keys: &SessionKeys, sid: u32, dir: u8, seq: u16, cipher: &[u8]) -> [u8; 16] {
    let mut msg = Vec::with_capacity(LABEL_MAC.len() + 7 + cipher.len());
    msg.extend_from_slice(LABEL_MAC);
    msg.extend_from_slice(&sid.to_be_bytes());
    msg.push(dir);
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(cipher);
    hmac16(&*keys.k_mac, &msg)
}

/// Seal an inner frame into a `0xB3` payload for the given direction
/// and sequence number.
pub fn seal_b3(keys: &SessionKeys, sid: u32, dir: u8, seq: u16, inner: &[u8]) -> Vec<u8> {
    let iv = frame_iv(keys, sid, dir, seq);
    let cipher = aes256_ctr(&keys.k_enc, &iv, inner);
    let mac = frame_mac(keys, sid, dir, seq, &cipher);

    let mut payload = Vec::with_capacity(4 + cipher.len() + 16);
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&(cipher.len() as u16).to_be_bytes());
    payload.extend_from_slice(&cipher);
    payload.extend_from_slice(&mac);
    payload
}

/// Open a `0xB3` payload sealed in the given direction.
///
/// Verifies the MAC before any decryption. Returns the sequence number
/// the frame carried and the inner plaintext bytes. Inbound sequence
/// numbers are authenticated but not checked against a monotonic
/// expectation; the dongle may retransmit replies.
pub fn open_b3(keys: &SessionKeys, sid: u32, dir: u8, payload: &[u8]) -> Result<(u16, Vec<u8>)> {
    if payload.len() < 2 + 2 + 16 {
        return Err(Error::BadFrame(format!(
            "secure frame too short: {} bytes",
            payload.len()
        )));
    }
    let seq = u16::from_be_bytes([payload[0], payload[1]]);
    let cipher_len = usize::from(u16::from_be_bytes([payload[2], payload[3]]));
    if payload.len() < 4 + cipher_len + 16 {
        return Err(Error::BadFrame(format!(
            "secure frame truncated: need {} bytes, got {}",
            4 + cipher_len + 16,
            payload.len()
        )));
    }
    let cipher = &payload[4..4 + cipher_len];
    let mac_in = &payload[4 + cipher_len..4 + cipher_len + 16];

    let mac_expected = frame_mac(keys, sid, dir, seq, cipher);
    if !bool::from(mac_expected.ct_eq(mac_in)) {
        return Err(Error::Auth("secure frame MAC mismatch".into()));
    }

    let iv = frame_iv(keys, sid, dir, seq);
    Ok((seq, aes256_ctr(&keys.k_enc, &iv, cipher)))
}

/// An established secure session.
///
/// Owns the symmetric keys and the outbound sequence counter, which
/// increments on every wrap and is never reused or rewound within the
/// session. Destroyed on disconnect or reset; never persisted.
pub struct Session {
    sid: u32,
    keys: SessionKeys,
    seq_out: u16,
}

// Manual impl: the derived form would print the session keys.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("seq_out", &self.seq_out)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Install a freshly negotiated session. The counter starts at 0.
    pub fn new(sid: u32, keys: SessionKeys) -> Self {
        Self {
            sid,
            keys,
            seq_out: 0,
        }
    }

    /// Session id negotiated in the handshake.
    pub fn sid(&self) -> u32 {
        self.sid
    }

    /// Next outbound sequence number (for tests/telemetry).
    pub fn seq_out(&self) -> u16 {
        self.seq_out
    }

    /// Wrap an application frame into a complete outer `0xB3` frame
    /// ready for transmission, consuming one sequence number.
    pub fn wrap_app_frame(&mut self, op: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let inner = encode_frame(op, payload)?;
        let b3_payload = seal_b3(&self.keys, self.sid, DIR_CLIENT, self.seq_out, &inner);
        let outer = encode_frame(opcode::SECURE, &b3_payload)?;
        // The number is consumed whether or not a reply ever arrives.
        self.seq_out = self.seq_out.wrapping_add(1);
        Ok(outer)
    }

    /// Unwrap an inbound `0xB3` payload into its inner application
    /// frame. Returns the authenticated inbound sequence number and
    /// the decoded frame.
    pub fn unwrap_app_frame(&self, b3_payload: &[u8]) -> Result<(u16, Frame)> {
        let (seq, inner) = open_b3(&self.keys, self.sid, DIR_SERVER, b3_payload)?;
        if inner.len() < FRAME_HEADER_LEN {
            return Err(Error::BadFrame("inner frame shorter than header".into()));
        }
        let op = inner[0];
        let len = usize::from(u16::from_le_bytes([inner[1], inner[2]]));
        if inner.len() < FRAME_HEADER_LEN + len {
            return Err(Error::BadFrame("inner frame length exceeds plaintext".into()));
        }
        let payload = inner[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        Ok((seq, Frame { op, payload }))
    }
}
