// ReliefMesh Core: offline messaging spine for disaster response
//
// "Does this get a help request one hop closer to someone who can act on it,
//  with no tower, no server and a phone at 6% battery?"
//
// If the answer is no, it doesn't belong in the core.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod message;
pub mod qos;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod transport;

use std::time::Duration;
use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MeshConfig};
pub use identity::{IdentityKeys, IdentityStore, PreKeyBundle};
pub use message::{Envelope, Location, MessageType, Payload};
pub use router::{
    DeliveredMessage, DropReason, FlushOutcome, InboundOutcome, MeshRouter, RouterBuilder,
    RouterStats, SendOptions, TickReport,
};
pub use scheduler::{PowerMode, SchedulerStatus};
pub use store::QueueStats;
pub use transport::{LocalHub, LocalTransport, MeshTransport};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    #[error("Decode error: {0}")]
    Decode(#[from] message::DecodeError),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("{message_type} rate limited, retry after {retry_after:?}")]
    RateLimited {
        message_type: MessageType,
        retry_after: Duration,
    },
    #[error("No session for thread {0}")]
    SessionNotFound(String),
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),
    #[error("Envelope {0} expired")]
    Expired(String),
    #[error("Mesh inactive for {message_type}: {reason}")]
    MeshInactive {
        message_type: MessageType,
        reason: String,
    },
    #[error("Outbound queue full ({0} entries)")]
    QueueFull(usize),
    #[error("Storage error: {0}")]
    Storage(#[from] store::StorageError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not running")]
    NotRunning,
    #[error("Already running")]
    AlreadyRunning,
}

impl From<qos::AdmissionError> for MeshError {
    fn from(err: qos::AdmissionError) -> Self {
        match err {
            qos::AdmissionError::RateLimited {
                message_type,
                retry_after,
            } => MeshError::RateLimited {
                message_type,
                retry_after,
            },
            qos::AdmissionError::MeshInactive {
                message_type,
                reason,
            } => MeshError::MeshInactive {
                message_type,
                reason,
            },
        }
    }
}

impl From<crypto::CryptoError> for MeshError {
    fn from(err: crypto::CryptoError) -> Self {
        use crypto::CryptoError;
        match err {
            CryptoError::SessionNotFound(thread) => MeshError::SessionNotFound(thread),
            CryptoError::InvalidBundleSignature
            | CryptoError::InvalidSignature
            | CryptoError::MissingSignature
            | CryptoError::DecryptionFailed
            | CryptoError::NotForUs => MeshError::Authentication(err.to_string()),
            other => MeshError::InvalidInput(other.to_string()),
        }
    }
}

impl From<store::QueueError> for MeshError {
    fn from(err: store::QueueError) -> Self {
        match err {
            store::QueueError::Expired(id) => MeshError::Expired(id),
            store::QueueError::Full(n) => MeshError::QueueFull(n),
            other => MeshError::InvalidInput(other.to_string()),
        }
    }
}

impl From<message::EncodeError> for MeshError {
    fn from(err: message::EncodeError) -> Self {
        match err {
            message::EncodeError::Invalid(e) => MeshError::Decode(e),
            other => MeshError::InvalidInput(other.to_string()),
        }
    }
}

impl From<ConfigError> for MeshError {
    fn from(err: ConfigError) -> Self {
        MeshError::InvalidInput(err.to_string())
    }
}
