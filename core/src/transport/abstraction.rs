//! Transport capability consumed by the mesh router
//!
//! Concrete drivers (BLE, Wi-Fi Aware, Nearby) live in the host platform and
//! implement [`MeshTransport`]. The core only ever scans, advertises, sends
//! opaque frames and receives them through the registered callback.

use crate::scheduler::DutyCycle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Inbound frame callback: (peer id, raw bytes).
pub type BytesCallback = Box<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// One frame handed up by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub transport: String,
    pub peer_id: String,
    pub bytes: Vec<u8>,
}

impl fmt::Display for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InboundFrame {{ transport: {}, peer: {}, len: {} }}",
            self.transport,
            self.peer_id,
            self.bytes.len()
        )
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transport not available: {0}")]
    NotAvailable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timeout after {0} ms")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Short-range transport driver.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Stable name used in logs and inbound frames
    fn name(&self) -> &str;

    async fn scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn advertise(&self) -> Result<(), TransportError>;

    async fn stop_advertise(&self) -> Result<(), TransportError>;

    /// Unicast a frame. `Ok(false)` means the peer was not reachable.
    async fn send(&self, peer_id: &str, bytes: &[u8]) -> Result<bool, TransportError>;

    /// Send to every reachable peer. Returns how many received the frame.
    async fn broadcast(&self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Raise or restore scan/advertise duty cycle (burst mode).
    async fn set_duty_cycle(&self, duty_cycle: DutyCycle) -> Result<(), TransportError>;

    /// Peers currently in range
    fn peer_count(&self) -> usize;

    /// Register the inbound frame callback. Replaces any previous one.
    fn set_on_bytes_received(&self, callback: BytesCallback);
}
