//! In-process dongle emulator and collaborator fakes.
//!
//! [`MockDongle`] implements [`Transport`] and plays the firmware side
//! of the whole protocol: provisioning, handshake, and the secure
//! channel, with knobs for the failure modes the client must survive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use blukey_client::{PasswordPrompt, SecretStore, Transport};
use blukey_core::{
    DIR_CLIENT, DIR_SERVER, Error, Result, SessionKeys, derive_session_keys, open_b3, seal_b3,
    server_finish_mac,
};
use blukey_crypto::{EphemeralKeyPair, aes256_ctr, hmac16, hmac_sha256, md5, pbkdf2_sha256};
use blukey_proto::{Framer, encode_frame, opcode};

const DONGLE_APP_KEY: [u8; 32] = [0xAA; 32];
const CHALLENGE_ITERATIONS: u32 = 64;

struct DongleSession {
    keys: SessionKeys,
    seq_out: u16,
}

struct State {
    // knobs
    password: String,
    wrap_key: bool,
    banner: Option<Vec<u8>>,
    chunk: usize,
    reply_delay: Option<Duration>,
    muted: bool,
    corrupt_hash: bool,
    status_ack: bool,
    // link
    link_up: bool,
    connects: u32,
    notify_tx: Option<mpsc::Sender<Vec<u8>>>,
    framer: Framer,
    // provisioning
    app_key: Option<[u8; 32]>,
    issued: Option<([u8; 16], [u8; 16])>,
    challenge_counter: u8,
    // handshake / secure channel
    server_keypair: Option<EphemeralKeyPair>,
    sid: u32,
    session: Option<DongleSession>,
    // application state
    layout: String,
    fast_keys: bool,
    typed: Vec<Vec<u8>>,
    taps: Vec<Vec<u8>>,
    op_log: Vec<u8>,
}

pub struct MockDongle {
    state: Mutex<State>,
}

impl MockDongle {
    pub fn new(password: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                password: password.to_string(),
                wrap_key: false,
                banner: None,
                chunk: 0,
                reply_delay: None,
                muted: false,
                corrupt_hash: false,
                status_ack: false,
                link_up: false,
                connects: 0,
                notify_tx: None,
                framer: Framer::new(),
                app_key: None,
                issued: None,
                challenge_counter: 0,
                server_keypair: None,
                sid: 0x1000,
                session: None,
                layout: "US_WINLIN".to_string(),
                fast_keys: false,
                typed: Vec::new(),
                taps: Vec::new(),
                op_log: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // knobs

    pub fn preset_app_key(&self, key: [u8; 32]) {
        self.lock().app_key = Some(key);
    }

    pub fn set_wrap_key(&self, on: bool) {
        self.lock().wrap_key = on;
    }

    pub fn set_banner(&self, banner: &[u8]) {
        self.lock().banner = Some(banner.to_vec());
    }

    pub fn set_chunk(&self, chunk: usize) {
        self.lock().chunk = chunk;
    }

    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.lock().reply_delay = delay;
    }

    pub fn set_muted(&self, muted: bool) {
        self.lock().muted = muted;
    }

    pub fn set_corrupt_hash(&self, on: bool) {
        self.lock().corrupt_hash = on;
    }

    pub fn set_status_ack(&self, on: bool) {
        self.lock().status_ack = on;
    }

    /// Push an unsolicited `0xFF` frame at the client, as a dongle
    /// might after an exchange the client already gave up on.
    pub fn inject_error(&self, token: &[u8]) {
        let s = self.lock();
        if let Some(tx) = &s.notify_tx {
            tx.try_send(encode_frame(opcode::ERROR, token).unwrap())
                .unwrap();
        }
    }

    // inspection

    pub fn app_key(&self) -> Option<[u8; 32]> {
        self.lock().app_key
    }

    pub fn typed(&self) -> Vec<Vec<u8>> {
        self.lock().typed.clone()
    }

    pub fn taps(&self) -> Vec<Vec<u8>> {
        self.lock().taps.clone()
    }

    pub fn op_log(&self) -> Vec<u8> {
        self.lock().op_log.clone()
    }

    pub fn layout(&self) -> String {
        self.lock().layout.clone()
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    // firmware behavior

    fn handle_frame(&self, s: &mut State, op: u8, payload: Vec<u8>) -> Vec<Vec<u8>> {
        match op {
            opcode::PROV_REQUEST => {
                s.challenge_counter = s.challenge_counter.wrapping_add(1);
                let salt = [s.challenge_counter; 16];
                let chal = [s.challenge_counter ^ 0xFF; 16];
                s.issued = Some((salt, chal));

                let mut body = salt.to_vec();
                body.extend_from_slice(&CHALLENGE_ITERATIONS.to_le_bytes());
                body.extend_from_slice(&chal);
                vec![encode_frame(opcode::PROV_CHALLENGE, &body).unwrap()]
            }
            opcode::PROV_PROOF => {
                let Some((salt, chal)) = s.issued.take() else {
                    return vec![encode_frame(opcode::ERROR, b"NO_CHALLENGE").unwrap()];
                };
                let verifier = pbkdf2_sha256(s.password.as_bytes(), &salt, CHALLENGE_ITERATIONS);
                let mut msg = b"APPKEY".to_vec();
                msg.extend_from_slice(&chal);
                let expected = hmac_sha256(&*verifier, &msg);
                if payload != expected {
                    return vec![encode_frame(opcode::ERROR, b"BAD_PROOF").unwrap()];
                }

                let key = *s.app_key.get_or_insert(DONGLE_APP_KEY);
                let body = if s.wrap_key {
                    let mut wrap_msg = b"AKWRAP".to_vec();
                    wrap_msg.extend_from_slice(&chal);
                    let wrap_key = hmac_sha256(&*verifier, &wrap_msg);

                    let mut iv_msg = b"AKIV".to_vec();
                    iv_msg.extend_from_slice(&chal);
                    let iv = hmac16(&*verifier, &iv_msg);

                    let cipher = aes256_ctr(&wrap_key, &iv, &key);

                    let mut mac_msg = b"AKMAC".to_vec();
                    mac_msg.extend_from_slice(&chal);
                    mac_msg.extend_from_slice(&cipher);
                    let mac = hmac16(&wrap_key, &mac_msg);

                    let mut body = cipher;
                    body.extend_from_slice(&mac);
                    body
                } else {
                    key.to_vec()
                };
                vec![encode_frame(opcode::PROV_KEY, &body).unwrap()]
            }
            opcode::CLIENT_HELLO => {
                let Some(app_key) = s.app_key else {
                    return vec![encode_frame(opcode::ERROR, b"NO_KEY").unwrap()];
                };
                if payload.len() != 81 {
                    return vec![encode_frame(opcode::ERROR, b"BAD_HELLO").unwrap()];
                }
                let client_pub = &payload[..65];
                let server_pub = *self.server_public(s);

                let mut msg = b"KEYX".to_vec();
                msg.extend_from_slice(&s.sid.to_be_bytes());
                msg.extend_from_slice(&server_pub);
                msg.extend_from_slice(client_pub);
                if hmac16(&app_key, &msg) != payload[65..81] {
                    return vec![encode_frame(opcode::ERROR, b"BADMAC").unwrap()];
                }

                let keypair = s.server_keypair.as_ref().unwrap();
                let shared = keypair.diffie_hellman(client_pub).unwrap();
                let keys =
                    derive_session_keys(&app_key, &shared, s.sid, &server_pub, client_pub).unwrap();
                let b2 = server_finish_mac(&keys, s.sid, &server_pub, client_pub);
                s.session = Some(DongleSession { keys, seq_out: 0 });
                vec![encode_frame(opcode::SERVER_FINISH, &b2).unwrap()]
            }
            opcode::SECURE => {
                let (inner_op, inner_payload) = {
                    let Some(session) = s.session.as_ref() else {
                        return vec![encode_frame(opcode::ERROR, b"NO_SESSION").unwrap()];
                    };
                    let (_, plain) =
                        open_b3(&session.keys, s.sid, DIR_CLIENT, &payload).unwrap();
                    parse_inner(&plain).unwrap()
                };
                s.op_log.push(inner_op);

                let reply = match inner_op {
                    opcode::SET_LAYOUT => {
                        s.layout = String::from_utf8(inner_payload).unwrap();
                        Some((opcode::ACK, Vec::new()))
                    }
                    opcode::GET_LAYOUT => Some((
                        opcode::LAYOUT_REPLY,
                        format!("LAYOUT={}", s.layout).into_bytes(),
                    )),
                    opcode::ENABLE_FAST_KEYS => {
                        s.fast_keys = true;
                        Some((opcode::ACK, Vec::new()))
                    }
                    opcode::SEND_TEXT => {
                        s.typed.push(inner_payload.clone());
                        let mut hash = md5(&inner_payload);
                        if s.corrupt_hash {
                            hash[0] ^= 0x01;
                        }
                        let body = if s.status_ack {
                            let mut body = vec![0u8];
                            body.extend_from_slice(&hash);
                            body
                        } else {
                            hash.to_vec()
                        };
                        Some((opcode::TEXT_HASH_ACK, body))
                    }
                    _ => None,
                };

                match reply {
                    Some((op, body)) => {
                        let session = s.session.as_mut().unwrap();
                        let inner = encode_frame(op, &body).unwrap();
                        let b3 =
                            seal_b3(&session.keys, s.sid, DIR_SERVER, session.seq_out, &inner);
                        session.seq_out = session.seq_out.wrapping_add(1);
                        vec![encode_frame(opcode::SECURE, &b3).unwrap()]
                    }
                    None => Vec::new(),
                }
            }
            opcode::RAW_KEY_TAP => {
                s.taps.push(payload);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn server_public<'a>(&self, s: &'a State) -> &'a [u8; 65] {
        s.server_keypair.as_ref().unwrap().public_bytes()
    }

    async fn process_write(&self, bytes: &[u8]) -> Result<()> {
        let (tx, delay, out) = {
            let mut s = self.lock();
            if !s.link_up {
                return Err(Error::Transport("link is down".into()));
            }
            if s.muted {
                return Ok(());
            }

            let frames = s.framer.push(bytes);
            let mut out = Vec::new();
            for frame in frames {
                for reply in self.handle_frame(&mut s, frame.op, frame.payload) {
                    out.extend(chunked(reply, s.chunk));
                }
            }
            (s.notify_tx.clone(), s.reply_delay, out)
        };

        let Some(tx) = tx else { return Ok(()) };
        match delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for chunk in out {
                        let _ = tx.send(chunk).await;
                    }
                });
            }
            None => {
                for chunk in out {
                    let _ = tx.send(chunk).await;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockDongle {
    async fn connect(&self, _device_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.link_up = true;
        s.connects += 1;
        s.framer.reset();
        s.session = None;
        s.fast_keys = false;
        s.server_keypair = Some(EphemeralKeyPair::generate());
        s.sid = s.sid.wrapping_add(1);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        let mut s = self.lock();

        // Boot output and the server hello arrive as soon as
        // notifications are enabled.
        let mut bytes = s.banner.clone().unwrap_or_default();
        let mut hello = self.server_public(&s).to_vec();
        hello.extend_from_slice(&s.sid.to_be_bytes());
        bytes.extend(encode_frame(opcode::SERVER_HELLO, &hello).unwrap());
        for chunk in chunked(bytes, s.chunk) {
            tx.try_send(chunk).unwrap();
        }

        s.notify_tx = Some(tx);
        rx
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.process_write(bytes).await
    }

    async fn write_control(&self, bytes: &[u8]) -> Result<()> {
        self.process_write(bytes).await
    }

    async fn disconnect(&self) {
        let mut s = self.lock();
        s.link_up = false;
        s.notify_tx = None;
        s.framer.reset();
        s.session = None;
    }

    fn max_write_len(&self) -> usize {
        512
    }

    fn link_up(&self) -> bool {
        self.lock().link_up
    }
}

fn parse_inner(plain: &[u8]) -> Option<(u8, Vec<u8>)> {
    if plain.len() < 3 {
        return None;
    }
    let len = usize::from(u16::from_le_bytes([plain[1], plain[2]]));
    if plain.len() < 3 + len {
        return None;
    }
    Some((plain[0], plain[3..3 + len].to_vec()))
}

fn chunked(bytes: Vec<u8>, chunk: usize) -> Vec<Vec<u8>> {
    if chunk == 0 {
        return vec![bytes];
    }
    bytes.chunks(chunk).map(<[u8]>::to_vec).collect()
}

/// In-memory key store.
#[derive(Default)]
pub struct MockStore {
    keys: Mutex<HashMap<String, [u8; 32]>>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_key(device_id: &str, key: [u8; 32]) -> Arc<Self> {
        let store = Self::default();
        store.keys.lock().unwrap().insert(device_id.to_string(), key);
        Arc::new(store)
    }

    pub fn key_for(&self, device_id: &str) -> Option<[u8; 32]> {
        self.keys.lock().unwrap().get(device_id).copied()
    }
}

impl SecretStore for MockStore {
    fn get(&self, device_id: &str) -> Option<[u8; 32]> {
        self.keys.lock().unwrap().get(device_id).copied()
    }

    fn put(&self, device_id: &str, key: &[u8; 32]) -> Result<()> {
        self.keys.lock().unwrap().insert(device_id.to_string(), *key);
        Ok(())
    }

    fn clear(&self, device_id: &str) {
        self.keys.lock().unwrap().remove(device_id);
    }
}

/// Prompt that answers with a fixed password, or cancels when unset.
pub struct MockPrompt {
    password: Option<String>,
    asked: Mutex<u32>,
}

impl MockPrompt {
    pub fn answering(password: &str) -> Arc<Self> {
        Arc::new(Self {
            password: Some(password.to_string()),
            asked: Mutex::new(0),
        })
    }

    pub fn cancelling() -> Arc<Self> {
        Arc::new(Self {
            password: None,
            asked: Mutex::new(0),
        })
    }

    pub fn asked(&self) -> u32 {
        *self.asked.lock().unwrap()
    }
}

#[async_trait]
impl PasswordPrompt for MockPrompt {
    async fn request_password(&self, _reason: &str) -> Option<String> {
        *self.asked.lock().unwrap() += 1;
        self.password.clone()
    }
}
