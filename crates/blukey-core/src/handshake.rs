//! Per-connection key-agreement handshake.
//!
//! On connect the dongle pushes a `0xB0` server hello. The client
//! answers `0xB1` with an ephemeral P-256 public key authenticated by
//! an APPKEY-keyed MAC, then verifies the dongle's `0xB2` finish MAC
//! under the derived session keys. Both sides prove possession of the
//! APPKEY without it ever crossing the transport.

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use blukey_crypto::{EphemeralKeyPair, PUBLIC_KEY_LEN, hkdf_sha256, hmac16};

use crate::error::{Error, Result};
use crate::secure::{Session, SessionKeys};

const LABEL_KEYX: &[u8] = b"KEYX";
const LABEL_SFIN: &[u8] = b"SFIN";
const LABEL_HKDF_INFO: &[u8] = b"MT1";

/// Expected `0xB2` payload length.
pub const SERVER_FINISH_LEN: usize = 16;

/// A `0xB0` server hello: `server_public(65) || sid_be32(4)`.
#[derive(Debug, Clone)]
pub struct ServerHello {
    /// Dongle's ephemeral public key, uncompressed SEC1.
    pub server_public: [u8; PUBLIC_KEY_LEN],
    /// Session id chosen by the dongle.
    pub sid: u32,
}

impl ServerHello {
    /// Parse a `0xB0` payload; any length other than 69 is rejected.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != PUBLIC_KEY_LEN + 4 {
            return Err(Error::BadFrame(format!(
                "server hello must be {} bytes, got {}",
                PUBLIC_KEY_LEN + 4,
                payload.len()
            )));
        }
        let mut server_public = [0u8; PUBLIC_KEY_LEN];
        server_public.copy_from_slice(&payload[..PUBLIC_KEY_LEN]);
        let sid = u32::from_be_bytes([payload[65], payload[66], payload[67], payload[68]]);
        Ok(Self { server_public, sid })
    }
}

/// `sid_be32 || server_public || client_public` — the transcript both
/// handshake MACs and the HKDF info are bound to.
fn transcript(sid: u32, server_public: &[u8], client_public: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + server_public.len() + client_public.len());
    out.extend_from_slice(&sid.to_be_bytes());
    out.extend_from_slice(server_public);
    out.extend_from_slice(client_public);
    out
}

/// Derive the session key set from the ECDH shared secret.
///
/// `session_key = HKDF-SHA256(salt = app_key, ikm = shared,
/// info = "MT1" || sid_be32 || server_pub || client_pub)`, then the
/// ENC/MAC/IVK subkeys by labeled HMAC. Public so protocol harnesses
/// can play the dongle side.
pub fn derive_session_keys(
    app_key: &[u8; 32],
    shared_secret: &[u8; 32],
    sid: u32,
    server_public: &[u8],
    client_public: &[u8],
) -> Result<SessionKeys> {
    let mut info = LABEL_HKDF_INFO.to_vec();
    info.extend_from_slice(&transcript(sid, server_public, client_public));

    let okm = hkdf_sha256(app_key, shared_secret, &info, 32)?;
    let mut session_key = Zeroizing::new([0u8; 32]);
    session_key.copy_from_slice(&okm);
    Ok(SessionKeys::from_session_key(session_key))
}

/// The server-finish MAC the dongle must present in `0xB2`.
pub fn server_finish_mac(
    keys: &SessionKeys,
    sid: u32,
    server_public: &[u8],
    client_public: &[u8],
) -> [u8; 16] {
    let mut msg = LABEL_SFIN.to_vec();
    msg.extend_from_slice(&transcript(sid, server_public, client_public));
    hmac16(&*keys.k_mac, &msg)
}

/// An in-flight handshake holding the ephemeral client keypair.
/// Dropped (keypair and all) when the handshake completes or fails.
pub struct Handshake {
    keypair: EphemeralKeyPair,
    hello: ServerHello,
}

impl Handshake {
    /// Start a handshake from a parsed server hello. Returns the
    /// state and the `0xB1` payload: `client_public(65) || mac16`,
    /// where the MAC proves APPKEY possession over the transcript.
    pub fn initiate(hello: ServerHello, app_key: &[u8; 32]) -> (Self, Vec<u8>) {
        Self::initiate_with_keypair(hello, app_key, EphemeralKeyPair::generate())
    }

    /// [`Handshake::initiate`] with a caller-supplied keypair, so test
    /// vectors can be reproduced.
    pub fn initiate_with_keypair(
        hello: ServerHello,
        app_key: &[u8; 32],
        keypair: EphemeralKeyPair,
    ) -> (Self, Vec<u8>) {
        let mut msg = LABEL_KEYX.to_vec();
        msg.extend_from_slice(&transcript(
            hello.sid,
            &hello.server_public,
            keypair.public_bytes(),
        ));
        let mac = hmac16(app_key, &msg);

        let mut b1 = Vec::with_capacity(PUBLIC_KEY_LEN + 16);
        b1.extend_from_slice(keypair.public_bytes());
        b1.extend_from_slice(&mac);

        (Self { keypair, hello }, b1)
    }

    /// Our ephemeral public key (as sent in `0xB1`).
    pub fn client_public(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.keypair.public_bytes()
    }

    /// Verify the `0xB2` server finish and produce the session.
    ///
    /// Consumes the handshake: the ephemeral private key does not
    /// outlive this call either way.
    pub fn finish(self, app_key: &[u8; 32], b2_payload: &[u8]) -> Result<Session> {
        if b2_payload.len() != SERVER_FINISH_LEN {
            return Err(Error::BadFrame(format!(
                "server finish must be {SERVER_FINISH_LEN} bytes, got {}",
                b2_payload.len()
            )));
        }

        let shared = self.keypair.diffie_hellman(&self.hello.server_public)?;
        let keys = derive_session_keys(
            app_key,
            &shared,
            self.hello.sid,
            &self.hello.server_public,
            self.keypair.public_bytes(),
        )?;

        let expected = server_finish_mac(
            &keys,
            self.hello.sid,
            &self.hello.server_public,
            self.keypair.public_bytes(),
        );
        if !bool::from(expected.ct_eq(b2_payload)) {
            return Err(Error::Auth("SFIN mismatch".into()));
        }

        tracing::debug!(sid = self.hello.sid, "server finish verified");
        Ok(Session::new(self.hello.sid, keys))
    }
}
