//! The command sequencer.
//!
//! All dongle traffic flows through a single actor task, so exactly one
//! command is in flight at any time and there is exactly one receive
//! wait outstanding. The public [`BluKeyClient`] handle is a thin
//! channel front: each call enqueues a command with a reply slot and
//! awaits it. An explicit disconnect cancels the in-flight command
//! preemptively via a [`CancellationToken`] and tears the link down.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blukey_core::{
    Challenge, Error, Handshake, PasswordMaterial, Result, ServerHello, Session, map_device_error,
    unwrap_app_key,
};
use blukey_crypto::md5;
use blukey_proto::{Frame, encode_frame, opcode};

use crate::config::ClientConfig;
use crate::router::RxRouter;
use crate::traits::{PasswordPrompt, SecretStore, Transport};

const COMMAND_QUEUE_DEPTH: usize = 32;

enum Step {
    Cancelled,
    Execute(Command),
    Shutdown,
}

enum Command {
    Connect {
        allow_provisioning: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Provision {
        password: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SendText {
        text: String,
        verify: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetLayout {
        layout: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GetLayout {
        reply: oneshot::Sender<Result<String>>,
    },
    EnableFastKeys {
        reply: oneshot::Sender<Result<()>>,
    },
    RawKeyTap {
        mods: u8,
        usage: u8,
        repeat: u8,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the sequencer task. Cheap to clone; dropping the last
/// clone shuts the task down after it tears the link down.
#[derive(Clone)]
pub struct BluKeyClient {
    cmd_tx: mpsc::Sender<Command>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl BluKeyClient {
    /// Spawn the sequencer. Must be called within a Tokio runtime.
    pub fn spawn(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SecretStore>,
        prompt: Arc<dyn PasswordPrompt>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancel = Arc::new(StdMutex::new(CancellationToken::new()));

        let hub = Hub {
            config,
            transport,
            store,
            prompt,
            router: Arc::new(RxRouter::new()),
            session: None,
            fast_keys_enabled: false,
            intake: None,
        };
        tokio::spawn(hub.run(cmd_rx, Arc::clone(&cancel)));

        Self { cmd_tx, cancel }
    }

    /// Connect and establish a secure session. With
    /// `allow_provisioning` the user may be prompted for the dongle
    /// password when no key is stored or the stored key is stale.
    pub async fn connect(&self, allow_provisioning: bool) -> Result<()> {
        self.submit(|reply| Command::Connect {
            allow_provisioning,
            reply,
        })
        .await
    }

    /// Provision with an explicit password, replacing any stored key,
    /// then reconnect with the new key.
    pub async fn provision(&self, password: impl Into<String>) -> Result<()> {
        let password = password.into();
        self.submit(|reply| Command::Provision { password, reply }).await
    }

    /// Have the dongle type `text`, verifying the echoed MD5.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.submit(|reply| Command::SendText {
            text,
            verify: true,
            reply,
        })
        .await
    }

    /// Have the dongle type `text` without waiting for the hash ack.
    pub async fn send_text_unverified(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.submit(|reply| Command::SendText {
            text,
            verify: false,
            reply,
        })
        .await
    }

    /// Switch the dongle's keyboard layout.
    pub async fn set_layout(&self, layout: impl Into<String>) -> Result<()> {
        let layout = layout.into();
        self.submit(|reply| Command::SetLayout { layout, reply }).await
    }

    /// Query the dongle's active keyboard layout code.
    pub async fn get_layout(&self) -> Result<String> {
        self.submit(|reply| Command::GetLayout { reply }).await
    }

    /// Enable raw-key mode for this session. Idempotent.
    pub async fn enable_fast_keys(&self) -> Result<()> {
        self.submit(|reply| Command::EnableFastKeys { reply }).await
    }

    /// Tap a raw HID key. Requires [`Self::enable_fast_keys`] first.
    pub async fn raw_key_tap(&self, mods: u8, usage: u8, repeat: u8) -> Result<()> {
        self.submit(|reply| Command::RawKeyTap {
            mods,
            usage,
            repeat,
            reply,
        })
        .await
    }

    /// Preemptively cancel the in-flight command (if any) and tear the
    /// link down. Returns immediately; the sequencer handles teardown.
    pub fn disconnect_now(&self) {
        let token = match self.cancel.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        token.cancel();
    }

    async fn submit<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        // A dropped reply slot means the command was cancelled (or the
        // sequencer shut down) before it produced a result.
        rx.await.map_err(|_| Error::Cancelled)?
    }
}

struct Hub {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SecretStore>,
    prompt: Arc<dyn PasswordPrompt>,
    router: Arc<RxRouter>,
    session: Option<Session>,
    fast_keys_enabled: bool,
    intake: Option<JoinHandle<()>>,
}

impl Hub {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        cancel: Arc<StdMutex<CancellationToken>>,
    ) {
        loop {
            let token = current_token(&cancel);
            let step = tokio::select! {
                () = token.cancelled() => Step::Cancelled,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => Step::Execute(cmd),
                    None => Step::Shutdown,
                },
            };
            match step {
                Step::Shutdown => break,
                Step::Cancelled => self.handle_cancel(&mut cmd_rx, &cancel).await,
                Step::Execute(cmd) => {
                    // If cancellation wins the race the command future
                    // is dropped mid-flight; its reply slot closes and
                    // the caller observes cancellation.
                    let cancelled = tokio::select! {
                        () = token.cancelled() => true,
                        () = self.execute(cmd) => false,
                    };
                    if cancelled {
                        self.handle_cancel(&mut cmd_rx, &cancel).await;
                    }
                }
            }
        }
        self.drop_link().await;
    }

    async fn handle_cancel(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<Command>,
        cancel: &Arc<StdMutex<CancellationToken>>,
    ) {
        info!("disconnect requested; tearing down link");
        self.drop_link().await;
        // Queued commands are stale once the user pulled the plug;
        // dropping their reply slots resolves them as cancelled.
        while cmd_rx.try_recv().is_ok() {}
        let fresh = CancellationToken::new();
        match cancel.lock() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    async fn execute(&mut self, cmd: Command) {
        match cmd {
            Command::Connect {
                allow_provisioning,
                reply,
            } => {
                let result = self.op_connect(allow_provisioning).await;
                let _ = reply.send(result);
            }
            Command::Provision { password, reply } => {
                let result = self.op_provision(&password).await;
                let _ = reply.send(result);
            }
            Command::SendText {
                text,
                verify,
                reply,
            } => {
                let result = self.op_send_text(text, verify).await;
                let _ = reply.send(result);
            }
            Command::SetLayout { layout, reply } => {
                let result = self.op_set_layout(&layout).await;
                let _ = reply.send(result);
            }
            Command::GetLayout { reply } => {
                let result = self.op_get_layout().await;
                let _ = reply.send(result);
            }
            Command::EnableFastKeys { reply } => {
                let result = self.op_enable_fast_keys().await;
                let _ = reply.send(result);
            }
            Command::RawKeyTap {
                mods,
                usage,
                repeat,
                reply,
            } => {
                let result = self.op_raw_key_tap(mods, usage, repeat).await;
                let _ = reply.send(result);
            }
        }
    }

    // --- link lifecycle ---

    async fn open_link(&mut self) -> Result<()> {
        self.drop_link().await;
        self.transport.connect(&self.config.device_id).await?;
        self.router.reset();

        let mut chunks = self.transport.subscribe();
        let router = Arc::clone(&self.router);
        self.intake = Some(tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                router.ingest(&chunk);
            }
            debug!("chunk stream closed");
        }));
        Ok(())
    }

    async fn drop_link(&mut self) {
        if let Some(intake) = self.intake.take() {
            intake.abort();
        }
        self.transport.disconnect().await;
        self.router.reset();
        self.session = None;
        self.fast_keys_enabled = false;
    }

    // --- connect / provision / handshake ---

    async fn op_connect(&mut self, allow_provisioning: bool) -> Result<()> {
        if self.session.is_some() && self.transport.link_up() {
            return Ok(());
        }
        self.connect_and_establish(allow_provisioning).await
    }

    async fn connect_and_establish(&mut self, allow_provisioning: bool) -> Result<()> {
        let mut allow = allow_provisioning;
        self.open_link().await?;
        loop {
            let hello = match self.await_server_hello().await {
                Ok(hello) => hello,
                Err(err) => {
                    self.drop_link().await;
                    return Err(err);
                }
            };

            let Some(app_key) = self.store.get(&self.config.device_id) else {
                if !allow {
                    self.drop_link().await;
                    return Err(Error::NotProvisioned);
                }
                if let Err(err) = self
                    .prompt_and_provision("Dongle password required to pair")
                    .await
                {
                    self.drop_link().await;
                    return Err(err);
                }
                // The dongle issues a fresh hello on a fresh link.
                allow = false;
                self.open_link().await?;
                continue;
            };

            match self.run_handshake(hello, &app_key).await {
                Ok(session) => {
                    info!(sid = session.sid(), "secure session established");
                    self.session = Some(session);
                    self.fast_keys_enabled = false;
                    if let Err(err) = self.op_get_layout().await {
                        // Layout is advisory; the session stands.
                        warn!(error = %err, "post-handshake layout refresh failed");
                    }
                    return Ok(());
                }
                Err(err) if err.is_key_mismatch() && allow => {
                    warn!(error = %err, "stored key rejected; reprovisioning");
                    self.store.clear(&self.config.device_id);
                    if let Err(err) = self
                        .prompt_and_provision("Stored key rejected; enter dongle password")
                        .await
                    {
                        self.drop_link().await;
                        return Err(err);
                    }
                    allow = false;
                    self.open_link().await?;
                }
                Err(err) => {
                    self.drop_link().await;
                    return Err(err);
                }
            }
        }
    }

    async fn op_provision(&mut self, password: &str) -> Result<()> {
        self.open_link().await?;
        // Wait for the hello so the dongle is past its boot banner and
        // ready to take control frames.
        let wait = self.await_server_hello().await;
        if let Err(err) = wait {
            self.drop_link().await;
            return Err(err);
        }
        if let Err(err) = self.run_provisioning(password).await {
            self.drop_link().await;
            return Err(err);
        }
        self.drop_link().await;
        self.connect_and_establish(false).await
    }

    async fn await_server_hello(&mut self) -> Result<ServerHello> {
        let budget = if self.store.get(&self.config.device_id).is_some() {
            self.config.hello_timeout
        } else {
            self.config.hello_timeout_unprovisioned
        };
        let frame = self
            .await_op_or_device_error(opcode::SERVER_HELLO, "server hello", budget)
            .await?;
        ServerHello::parse(&frame.payload)
    }

    async fn prompt_and_provision(&mut self, reason: &str) -> Result<()> {
        let password = self
            .prompt
            .request_password(reason)
            .await
            .ok_or(Error::Cancelled)?;
        self.run_provisioning(&password).await
    }

    /// Run the challenge/proof exchange and store the issued key.
    ///
    /// The raw password bytes are tried first; on rejection a second
    /// attempt uses the trimmed, NFKC-normalized form against a fresh
    /// challenge, since a stale challenge is single-use.
    async fn run_provisioning(&mut self, password: &str) -> Result<()> {
        let challenge = self.request_challenge().await?;
        let material = PasswordMaterial::raw(password, &challenge);
        let key = match self.try_proof(&material, &challenge).await {
            Ok(key) => key,
            Err(first_err @ (Error::Auth(_) | Error::Device(_))) => {
                debug!(error = %first_err, "raw password encoding rejected; retrying normalized");
                let challenge = self.request_challenge().await?;
                let material = PasswordMaterial::normalized(password, &challenge);
                self.try_proof(&material, &challenge).await?
            }
            Err(err) => return Err(err),
        };
        self.store.put(&self.config.device_id, &key)?;
        info!("provisioned new key");
        Ok(())
    }

    async fn request_challenge(&mut self) -> Result<Challenge> {
        self.send_control_frame(opcode::PROV_REQUEST, &[]).await?;
        let frame = self
            .await_op_or_device_error(
                opcode::PROV_CHALLENGE,
                "provisioning challenge",
                self.config.provision_timeout,
            )
            .await?;
        Challenge::parse(&frame.payload)
    }

    async fn try_proof(
        &mut self,
        material: &PasswordMaterial,
        challenge: &Challenge,
    ) -> Result<zeroize::Zeroizing<[u8; 32]>> {
        self.send_control_frame(opcode::PROV_PROOF, material.proof())
            .await?;
        let frame = self
            .await_op_or_device_error(
                opcode::PROV_KEY,
                "key delivery",
                self.config.provision_timeout,
            )
            .await?;
        unwrap_app_key(material, challenge, &frame.payload)
            .ok_or_else(|| Error::Auth("proof rejected".into()))
    }

    async fn run_handshake(&mut self, hello: ServerHello, app_key: &[u8; 32]) -> Result<Session> {
        let (handshake, b1) = Handshake::initiate(hello, app_key);
        self.send_control_frame(opcode::CLIENT_HELLO, &b1).await?;
        let frame = self
            .await_op_or_device_error(
                opcode::SERVER_FINISH,
                "server finish",
                self.config.reply_timeout,
            )
            .await?;
        handshake.finish(app_key, &frame.payload)
    }

    // --- application operations ---

    async fn op_send_text(&mut self, mut text: String, verify: bool) -> Result<()> {
        self.ensure_session().await?;
        if self.config.append_newline && !text.ends_with('\n') {
            text.push('\n');
        }
        let expected = md5(text.as_bytes());

        self.send_app_frame(opcode::SEND_TEXT, text.as_bytes())
            .await?;
        if !verify {
            return Ok(());
        }
        let reply = self
            .await_app_reply(
                opcode::TEXT_HASH_ACK,
                "text hash ack",
                self.config.send_text_timeout,
            )
            .await?;

        let echoed: &[u8] = match reply.payload.len() {
            16 => &reply.payload,
            n if n >= 17 => {
                let status = reply.payload[0];
                if status != 0 {
                    return Err(Error::Device(format!("typing failed, status {status}")));
                }
                &reply.payload[1..17]
            }
            n => {
                return Err(Error::BadFrame(format!("hash ack has {n} bytes")));
            }
        };
        if echoed != expected {
            return Err(Error::HashMismatch);
        }
        Ok(())
    }

    async fn op_set_layout(&mut self, layout: &str) -> Result<()> {
        self.ensure_session().await?;
        self.send_app_frame(opcode::SET_LAYOUT, layout.as_bytes())
            .await?;
        let reply = self
            .await_app_reply(opcode::ACK, "layout ack", self.config.reply_timeout)
            .await?;
        if !reply.payload.is_empty() {
            return Err(Error::BadFrame("layout ack carried a payload".into()));
        }
        Ok(())
    }

    async fn op_get_layout(&mut self) -> Result<String> {
        self.ensure_session().await?;
        self.send_app_frame(opcode::GET_LAYOUT, &[]).await?;
        let reply = self
            .await_app_reply(
                opcode::LAYOUT_REPLY,
                "layout reply",
                self.config.reply_timeout,
            )
            .await?;
        parse_layout_code(&reply.payload)
    }

    async fn op_enable_fast_keys(&mut self) -> Result<()> {
        self.ensure_session().await?;
        if self.fast_keys_enabled {
            return Ok(());
        }
        self.send_app_frame(opcode::ENABLE_FAST_KEYS, &[0x01]).await?;
        self.await_app_reply(opcode::ACK, "fast-keys ack", self.config.reply_timeout)
            .await?;
        self.fast_keys_enabled = true;
        Ok(())
    }

    async fn op_raw_key_tap(&mut self, mods: u8, usage: u8, repeat: u8) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::NotSecure);
        }
        if !self.fast_keys_enabled {
            return Err(Error::FastKeysNotEnabled);
        }
        // Taps ride the latency-critical raw path, unencrypted by
        // firmware design; the session gate above still applies.
        let mut payload = vec![mods, usage];
        if repeat > 1 {
            payload.push(repeat);
        }
        let bytes = encode_frame(opcode::RAW_KEY_TAP, &payload)?;
        self.transport.write(&bytes).await
    }

    // --- frame plumbing ---

    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() && self.transport.link_up() {
            return Ok(());
        }
        // Boxed: establishing a session can itself issue a layout
        // refresh, which lands back here.
        Box::pin(self.connect_and_establish(false)).await
    }

    async fn send_control_frame(&self, op: u8, payload: &[u8]) -> Result<()> {
        let bytes = encode_frame(op, payload)?;
        self.check_write_len(bytes.len())?;
        self.transport.write_control(&bytes).await
    }

    async fn send_app_frame(&mut self, op: u8, payload: &[u8]) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotSecure)?;
        let bytes = session.wrap_app_frame(op, payload)?;
        self.check_write_len(bytes.len())?;
        self.transport.write(&bytes).await
    }

    fn check_write_len(&self, len: usize) -> Result<()> {
        let max = self.transport.max_write_len();
        if len > max {
            return Err(Error::Transport(format!(
                "frame of {len} bytes exceeds negotiated write size {max}"
            )));
        }
        Ok(())
    }

    /// Await a frame of the given op, treating an interleaved `0xFF`
    /// as the command's failure.
    async fn await_op_or_device_error(
        &self,
        op: u8,
        what: &'static str,
        budget: Duration,
    ) -> Result<Frame> {
        let frame = self
            .router
            .await_frame(budget, move |f| f.op == op || f.op == opcode::ERROR)
            .await
            .ok_or(Error::Timeout(what))?;
        if frame.op == opcode::ERROR {
            return Err(Error::Device(map_device_error(&frame.payload)));
        }
        Ok(frame)
    }

    /// Await a secure-channel reply with the given inner op. Only
    /// `0xB3` frames are consumed here; a stale `0xFF` left over from
    /// an earlier exchange stays in the backlog. Secure frames that
    /// decode to a different op (or fail to decode) are logged and
    /// skipped without consuming the budget's remainder.
    async fn await_app_reply(
        &mut self,
        inner_op: u8,
        what: &'static str,
        budget: Duration,
    ) -> Result<Frame> {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(what));
            }
            let frame = self
                .router
                .await_frame(remaining, |f| f.op == opcode::SECURE)
                .await
                .ok_or(Error::Timeout(what))?;
            let session = self.session.as_ref().ok_or(Error::NotSecure)?;
            match session.unwrap_app_frame(&frame.payload) {
                Ok((_, inner)) if inner.op == inner_op => return Ok(inner),
                Ok((_, inner)) => {
                    debug!(op = inner.op, "skipping unrelated secure reply");
                }
                Err(err) => {
                    debug!(error = %err, "discarding undecodable secure frame");
                }
            }
        }
    }
}

fn current_token(cancel: &Arc<StdMutex<CancellationToken>>) -> CancellationToken {
    match cancel.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Extract the layout code from a `0xC2` payload: the token after
/// `LAYOUT=`, terminated by whitespace or `;`.
fn parse_layout_code(payload: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(payload);
    let Some(start) = text.find("LAYOUT=") else {
        return Err(Error::LayoutMissing);
    };
    let rest = &text[start + "LAYOUT=".len()..];
    let code: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ';')
        .collect();
    if code.is_empty() {
        return Err(Error::LayoutMissing);
    }
    Ok(code)
}
