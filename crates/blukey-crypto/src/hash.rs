//! MD5 and HMAC-SHA256.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// MD5 digest. Used only to verify the dongle typed the text we sent,
/// never for anything security-relevant.
pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// HMAC-SHA256 over `msg` with `key`.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// First 16 bytes of [`hmac_sha256`] — the wire protocol's truncated MAC.
pub fn hmac16(key: &[u8], msg: &[u8]) -> [u8; 16] {
    let full = hmac_sha256(key, msg);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}
