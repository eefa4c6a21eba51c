//! AES-256-CTR.

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};

/// AES-256 in CTR mode with a big-endian counter, matching the dongle's
/// `kCCModeOptionCTR_BE` convention. CTR is symmetric, so the same call
/// encrypts and decrypts.
pub fn aes256_ctr(key: &[u8; 32], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut cipher = Ctr128BE::<Aes256>::new(key.into(), iv.into());
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    out
}
