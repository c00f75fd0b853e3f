// Cryptography module: envelope signing, session handshake and ratchet

pub mod kdf;
pub mod session;
pub mod signing;
pub mod store;

pub use session::{Session, SessionRecord};
pub use signing::{sign_envelope, verify_envelope};
pub use store::SessionStore;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Pre-key bundle signature does not verify")]
    InvalidBundleSignature,
    #[error("Invalid pre-key bundle: {0}")]
    InvalidBundle(String),
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("Handshake is addressed to another identity")]
    NotForUs,
    #[error("No session for thread {0}")]
    SessionNotFound(String),
    #[error("Message belongs to a different thread")]
    ThreadMismatch,
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,
    #[error("Message counter {counter} is behind the chain ({expected})")]
    CounterTooOld { counter: u32, expected: u32 },
    #[error("Message skips {skip} keys (max {max})")]
    TooManySkipped { skip: u32, max: u32 },
    #[error("Sending chain exhausted")]
    ChainExhausted,
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Envelope is not signed")]
    MissingSignature,
    #[error("Envelope signature does not verify")]
    InvalidSignature,
    #[error("Serialization error: {0}")]
    Serialization(String),
}
