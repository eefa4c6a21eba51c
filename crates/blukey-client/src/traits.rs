//! Collaborator traits implemented by the platform embedding.

use async_trait::async_trait;
use tokio::sync::mpsc;

use blukey_core::Result;

/// The BLE link. Scanning, GATT discovery and characteristic selection
/// are the platform's business; the client only needs connect, two
/// write paths, and a push stream of raw notification chunks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the link to the given device. Resolves exactly once.
    async fn connect(&self, device_id: &str) -> Result<()>;

    /// Take the inbound chunk stream for the current link. Chunks are
    /// raw notification payloads and need not be frame-aligned.
    fn subscribe(&self) -> mpsc::Receiver<Vec<u8>>;

    /// Write bytes on the data characteristic. Resolves exactly once
    /// with success or failure; never truncates.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Write bytes on the control characteristic (provisioning and
    /// handshake frames).
    async fn write_control(&self, bytes: &[u8]) -> Result<()>;

    /// Drop the link. Idempotent.
    async fn disconnect(&self);

    /// Negotiated maximum write size. The client rejects oversized
    /// writes before transmission.
    fn max_write_len(&self) -> usize;

    /// Whether the link is currently up.
    fn link_up(&self) -> bool;
}

/// APPKEY storage, keyed by device identity. Backed by the platform
/// keychain/keystore; last-write-wins is sufficient.
pub trait SecretStore: Send + Sync + 'static {
    /// Fetch the stored APPKEY for a device, if any.
    fn get(&self, device_id: &str) -> Option<[u8; 32]>;

    /// Store (or replace) the APPKEY for a device.
    fn put(&self, device_id: &str, key: &[u8; 32]) -> Result<()>;

    /// Forget the APPKEY for a device.
    fn clear(&self, device_id: &str);
}

/// Provisioning password prompt. Invoked only when the running command
/// explicitly allows provisioning; the wait is unbounded and ends when
/// the user answers or cancels.
#[async_trait]
pub trait PasswordPrompt: Send + Sync + 'static {
    /// Ask the user for the dongle password. `None` means cancelled.
    async fn request_password(&self, reason: &str) -> Option<String>;
}
