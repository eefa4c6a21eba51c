//! APPKEY provisioning: challenge parsing, proof derivation, key
//! unwrapping, and device error-token mapping.
//!
//! Provisioning runs once per device identity. The dongle issues a
//! single-use PBKDF2 challenge (`0xA2`); the client proves knowledge of
//! the dongle password (`0xA3`) and receives the 32-byte APPKEY
//! (`0xA1`), either bare or wrapped under a challenge-bound key.
//!
//! Passwords are tried in two encodings: the raw UTF-8 bytes first,
//! then (against a *fresh* challenge) a trimmed, NFKC-normalized form,
//! because mobile keyboards disagree about composed characters and
//! trailing whitespace.

use subtle::ConstantTimeEq;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use blukey_crypto::{aes256_ctr, hmac_sha256, hmac16, pbkdf2_sha256};

use crate::error::{Error, Result};

const LABEL_PROOF: &[u8] = b"APPKEY";
const LABEL_WRAP_KEY: &[u8] = b"AKWRAP";
const LABEL_WRAP_MAC: &[u8] = b"AKMAC";
const LABEL_WRAP_IV: &[u8] = b"AKIV";

/// A provisioning challenge decoded from an `0xA2` payload.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// PBKDF2 salt.
    pub salt: [u8; 16],
    /// PBKDF2 iteration count as sent; clamped to >= 1 when used.
    pub iterations: u32,
    /// Single-use challenge nonce.
    pub challenge: [u8; 16],
}

impl Challenge {
    /// Parse `salt(16) || iterations_le32(4) || challenge(16)`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 36 {
            return Err(Error::BadFrame(format!(
                "challenge must be 36 bytes, got {}",
                payload.len()
            )));
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&payload[..16]);
        let iterations = u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]);
        let mut challenge = [0u8; 16];
        challenge.copy_from_slice(&payload[20..36]);
        Ok(Self {
            salt,
            iterations,
            challenge,
        })
    }
}

/// Verifier and proof derived from one password encoding against one
/// challenge. The verifier never leaves the device; only the proof is
/// transmitted.
pub struct PasswordMaterial {
    verifier: Zeroizing<[u8; 32]>,
    proof: [u8; 32],
}

impl PasswordMaterial {
    /// Derive from the password's raw UTF-8 bytes.
    pub fn raw(password: &str, challenge: &Challenge) -> Self {
        Self::derive(password.as_bytes(), challenge)
    }

    /// Derive from the whitespace-trimmed, NFKC-normalized password.
    pub fn normalized(password: &str, challenge: &Challenge) -> Self {
        let normalized: Zeroizing<String> =
            Zeroizing::new(password.trim().nfkc().collect::<String>());
        Self::derive(normalized.as_bytes(), challenge)
    }

    fn derive(password_bytes: &[u8], challenge: &Challenge) -> Self {
        // A zero iteration count in a corrupt challenge must not
        // degrade PBKDF2 into a no-op.
        let iterations = challenge.iterations.max(1);
        let verifier = pbkdf2_sha256(password_bytes, &challenge.salt, iterations);

        let mut msg = Vec::with_capacity(LABEL_PROOF.len() + 16);
        msg.extend_from_slice(LABEL_PROOF);
        msg.extend_from_slice(&challenge.challenge);
        let proof = hmac_sha256(&*verifier, &msg);

        Self { verifier, proof }
    }

    /// The 32-byte proof to send in the `0xA3` frame.
    pub fn proof(&self) -> &[u8; 32] {
        &self.proof
    }
}

/// Recover the APPKEY from an `0xA1` payload.
///
/// A 32-byte payload is the key itself. A 48-byte payload is
/// `cipher(32) || mac(16)` wrapped under keys bound to the verifier and
/// challenge. Anything else, or a MAC mismatch, means the proof was
/// rejected.
pub fn unwrap_app_key(
    material: &PasswordMaterial,
    challenge: &Challenge,
    payload: &[u8],
) -> Option<Zeroizing<[u8; 32]>> {
    match payload.len() {
        32 => {
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(payload);
            Some(key)
        }
        48 => {
            let cipher = &payload[..32];
            let mac_in = &payload[32..48];

            let mut wrap_msg = Vec::with_capacity(LABEL_WRAP_KEY.len() + 16);
            wrap_msg.extend_from_slice(LABEL_WRAP_KEY);
            wrap_msg.extend_from_slice(&challenge.challenge);
            let wrap_key = Zeroizing::new(hmac_sha256(&*material.verifier, &wrap_msg));

            let mut mac_msg = Vec::with_capacity(LABEL_WRAP_MAC.len() + 16 + 32);
            mac_msg.extend_from_slice(LABEL_WRAP_MAC);
            mac_msg.extend_from_slice(&challenge.challenge);
            mac_msg.extend_from_slice(cipher);
            let mac_expected = hmac16(&*wrap_key, &mac_msg);
            if !bool::from(mac_expected.ct_eq(mac_in)) {
                return None;
            }

            let mut iv_msg = Vec::with_capacity(LABEL_WRAP_IV.len() + 16);
            iv_msg.extend_from_slice(LABEL_WRAP_IV);
            iv_msg.extend_from_slice(&challenge.challenge);
            let iv = hmac16(&*material.verifier, &iv_msg);

            let plain = Zeroizing::new(aes256_ctr(&wrap_key, &iv, cipher));
            if plain.len() != 32 {
                return None;
            }
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&plain);
            Some(key)
        }
        _ => None,
    }
}

/// Map an `0xFF` error payload to a user-facing description.
pub fn map_device_error(payload: &[u8]) -> String {
    if payload.is_empty() {
        return "Device error".to_string();
    }
    let raw = String::from_utf8_lossy(payload);

    if raw.to_uppercase().contains("LOCKED_SINGLE_NEED_RESET") {
        return "Dongle is locked (single-app strict mode). To provision a new app you must \
                factory reset the dongle."
            .to_string();
    }
    if raw.contains("MULTI_APP_DISABLED") {
        return "Dongle does not allow multi-app provisioning. Reset APPKEY on dongle.".to_string();
    }
    if raw.contains("BAD_PROOF") {
        return "Bad password / proof.".to_string();
    }
    if raw.contains("NO_CHALLENGE") {
        return "Device refused challenge.".to_string();
    }
    raw.into_owned()
}
