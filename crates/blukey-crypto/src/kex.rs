//! Ephemeral P-256 ECDH key agreement.
//!
//! Public keys cross the wire in uncompressed SEC1 form
//! (`0x04 || x || y`, 65 bytes). The raw X-coordinate shared secret is
//! fed straight into HKDF by the handshake; it is never used as a key
//! directly.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Uncompressed SEC1 public key length.
pub const PUBLIC_KEY_LEN: usize = 65;

/// Raw ECDH shared secret length (P-256 X coordinate).
pub const SHARED_SECRET_LEN: usize = 32;

/// An ephemeral P-256 keypair, generated per connection and discarded
/// when the handshake completes or fails.
pub struct EphemeralKeyPair {
    secret: SecretKey,
    public_bytes: [u8; PUBLIC_KEY_LEN],
}

impl EphemeralKeyPair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        Self::from_secret(secret)
    }

    /// Build a keypair from a raw 32-byte scalar. Handshake test
    /// vectors need reproducible keys; production code always uses
    /// [`EphemeralKeyPair::generate`].
    pub fn from_private(private: &[u8]) -> Result<Self, CryptoError> {
        if private.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: private.len(),
            });
        }
        let secret = SecretKey::from_slice(private)
            .map_err(|e| CryptoError::InvalidPeerKey(format!("bad P-256 scalar: {e}")))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let mut public_bytes = [0u8; PUBLIC_KEY_LEN];
        public_bytes.copy_from_slice(point.as_bytes());
        Self {
            secret,
            public_bytes,
        }
    }

    /// Our public key, uncompressed SEC1.
    pub fn public_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_bytes
    }

    /// ECDH against a peer's uncompressed public key.
    ///
    /// Rejects malformed encodings and points not on the curve; the
    /// `p256` crate validates the point during parsing.
    pub fn diffie_hellman(
        &self,
        peer_public: &[u8],
    ) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>, CryptoError> {
        if peer_public.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                actual: peer_public.len(),
            });
        }
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|e| CryptoError::InvalidPeerKey(e.to_string()))?;

        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_uncompressed_sec1() {
        let kp = EphemeralKeyPair::generate();
        assert_eq!(kp.public_bytes().len(), PUBLIC_KEY_LEN);
        assert_eq!(kp.public_bytes()[0], 0x04);
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();

        let ab = a.diffie_hellman(b.public_bytes()).unwrap();
        let ba = b.diffie_hellman(a.public_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn from_private_is_deterministic() {
        let kp1 = EphemeralKeyPair::from_private(&[0x42; 32]).unwrap();
        let kp2 = EphemeralKeyPair::from_private(&[0x42; 32]).unwrap();
        assert_eq!(kp1.public_bytes(), kp2.public_bytes());
    }

    #[test]
    fn invalid_peer_point_is_rejected() {
        let kp = EphemeralKeyPair::generate();

        // Right length, not a curve point.
        let mut bogus = [0u8; PUBLIC_KEY_LEN];
        bogus[0] = 0x04;
        bogus[1] = 0xFF;
        assert!(matches!(
            kp.diffie_hellman(&bogus),
            Err(CryptoError::InvalidPeerKey(_))
        ));

        // Wrong length.
        assert!(matches!(
            kp.diffie_hellman(&[0x04; 33]),
            Err(CryptoError::InvalidKeyLength { expected: 65, actual: 33 })
        ));
    }

    #[test]
    fn zero_scalar_is_rejected() {
        assert!(EphemeralKeyPair::from_private(&[0; 32]).is_err());
    }
}
