use std::time::Duration;

/// Client behavior knobs. Defaults mirror the dongle firmware's own
/// timing expectations.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Platform identity of the target device (address or UUID).
    pub device_id: String,
    /// Append `\n` to text before sending and hashing.
    pub append_newline: bool,
    /// Wait for the server hello when a key is already on file.
    pub hello_timeout: Duration,
    /// Wait for the server hello when provisioning may be needed
    /// (the dongle boots slower into pairing mode).
    pub hello_timeout_unprovisioned: Duration,
    /// Wait for a provisioning round trip (challenge, key delivery).
    pub provision_timeout: Duration,
    /// Wait for the hash acknowledgement after sending text.
    pub send_text_timeout: Duration,
    /// Wait for any other single application reply.
    pub reply_timeout: Duration,
}

impl ClientConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            append_newline: false,
            hello_timeout: Duration::from_secs(6),
            hello_timeout_unprovisioned: Duration::from_secs(8),
            provision_timeout: Duration::from_secs(6),
            send_text_timeout: Duration::from_secs(6),
            reply_timeout: Duration::from_secs(4),
        }
    }
}
