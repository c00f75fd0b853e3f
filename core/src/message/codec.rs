// Envelope codec: compact, deterministic framing for low-bandwidth links
//
// Frame layout:
//   [version: u8][type tag: u8][bincode body (varint ints, no trailing bytes)]
//
// The type tag lives outside the body so a node can recognise and drop a
// type it does not know without parsing the rest.

use super::types::{Envelope, Location, MessageType, Payload, SealedPayload, MAX_TTL};
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current frame version.
pub const WIRE_VERSION: u8 = 1;

/// Maximum encoded envelope size: 8 KB
/// Short-range links fragment anything larger; this also bounds allocation
/// when decoding untrusted input.
pub const MAX_ENVELOPE_SIZE: usize = 8 * 1024;

/// Maximum free-text note length in bytes
pub const MAX_NOTE_LEN: usize = 512;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Frame truncated: {0} bytes")]
    Truncated(usize),
    #[error("Frame too large: {0} bytes (max {MAX_ENVELOPE_SIZE})")]
    TooLarge(usize),
    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown message type tag: {0}")]
    UnknownType(u8),
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    #[error("TTL out of range: {0} (max {MAX_TTL})")]
    TtlOutOfRange(u8),
    #[error("{message_type} envelope missing required field: {field}")]
    MissingField {
        message_type: MessageType,
        field: &'static str,
    },
    #[error("Payload is {actual} but envelope declares {declared}")]
    PayloadMismatch {
        declared: MessageType,
        actual: MessageType,
    },
}

impl DecodeError {
    /// Unknown types come from newer peers; they are dropped, not counted
    /// as malformed traffic.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::UnknownType(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("Invalid envelope: {0}")]
    Invalid(#[from] DecodeError),
    #[error("Encoded envelope too large: {0} bytes (max {MAX_ENVELOPE_SIZE})")]
    TooLarge(usize),
    #[error("Serialization failed: {0}")]
    Serialize(String),
}

// Body without the type (carried in the header). Field order is the wire order.
#[derive(Serialize)]
struct WireBodyRef<'a> {
    id: &'a str,
    ts: u64,
    loc: &'a Option<Location>,
    priority: u8,
    ttl: u8,
    hop: u8,
    sender: &'a [u8; 32],
    payload: &'a Option<Payload>,
    enc: &'a Option<SealedPayload>,
    sig: &'a Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct WireBody {
    id: String,
    ts: u64,
    loc: Option<Location>,
    priority: u8,
    ttl: u8,
    hop: u8,
    sender: [u8; 32],
    payload: Option<Payload>,
    enc: Option<SealedPayload>,
    sig: Option<Vec<u8>>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
        .with_limit(MAX_ENVELOPE_SIZE as u64)
}

/// Check every structural rule an envelope must satisfy on the wire.
pub fn validate_envelope(env: &Envelope) -> Result<(), DecodeError> {
    let declared = env.message_type;
    let missing = |field| DecodeError::MissingField {
        message_type: declared,
        field,
    };

    if env.id.is_empty() {
        return Err(missing("id"));
    }
    if env.ttl > MAX_TTL {
        return Err(DecodeError::TtlOutOfRange(env.ttl));
    }
    if let Some(loc) = &env.loc {
        if !loc.is_valid() {
            return Err(DecodeError::Malformed(format!(
                "location out of range: ({}, {})",
                loc.lat, loc.lon
            )));
        }
    }
    if declared == MessageType::Position && env.loc.is_none() {
        return Err(missing("loc"));
    }
    if let Some(sig) = &env.sig {
        if sig.len() != SIGNATURE_LEN {
            return Err(DecodeError::Malformed(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LEN,
                sig.len()
            )));
        }
    }

    match (&env.payload, &env.enc) {
        (Some(_), Some(_)) => Err(DecodeError::Malformed(
            "both plaintext payload and ciphertext present".into(),
        )),
        (None, None) => Err(missing("payload")),
        (Some(payload), None) => {
            let actual = payload.message_type();
            if actual != declared {
                return Err(DecodeError::PayloadMismatch { declared, actual });
            }
            if let Some(field) = payload.missing_field() {
                return Err(missing(field));
            }
            if payload.note().map_or(false, |n| n.len() > MAX_NOTE_LEN) {
                return Err(DecodeError::Malformed(format!(
                    "note longer than {} bytes",
                    MAX_NOTE_LEN
                )));
            }
            Ok(())
        }
        (None, Some(sealed)) => {
            if sealed.thread_id.is_empty() {
                return Err(missing("enc.thread_id"));
            }
            if sealed.ciphertext.is_empty() {
                return Err(missing("enc.ciphertext"));
            }
            Ok(())
        }
    }
}

fn encode_frame(env: &Envelope, hop: u8, sig: &Option<Vec<u8>>) -> Result<Vec<u8>, EncodeError> {
    validate_envelope(env)?;

    let body = WireBodyRef {
        id: &env.id,
        ts: env.ts,
        loc: &env.loc,
        priority: env.priority,
        ttl: env.ttl,
        hop,
        sender: &env.sender,
        payload: &env.payload,
        enc: &env.enc,
        sig,
    };

    let encoded = wire_options()
        .serialize(&body)
        .map_err(|e| EncodeError::Serialize(e.to_string()))?;

    let total = HEADER_LEN + encoded.len();
    if total > MAX_ENVELOPE_SIZE {
        return Err(EncodeError::TooLarge(total));
    }

    let mut out = Vec::with_capacity(total);
    out.push(WIRE_VERSION);
    out.push(env.message_type.wire_tag());
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Serialize an envelope to its wire frame.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, EncodeError> {
    encode_frame(env, env.hop, &env.sig)
}

/// Bytes covered by the sender's signature: the frame with no signature
/// and hop reset to zero, so relays can bump `hop` without re-signing.
pub fn canonical_signing_bytes(env: &Envelope) -> Result<Vec<u8>, EncodeError> {
    encode_frame(env, 0, &None)
}

/// Parse and validate a wire frame.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    if bytes.len() <= HEADER_LEN {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    if bytes[0] != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(bytes[0]));
    }
    let message_type =
        MessageType::from_wire_tag(bytes[1]).ok_or(DecodeError::UnknownType(bytes[1]))?;

    let body: WireBody = wire_options()
        .deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let env = Envelope {
        id: body.id,
        message_type,
        ts: body.ts,
        loc: body.loc,
        priority: body.priority,
        ttl: body.ttl,
        hop: body.hop,
        sender: body.sender,
        payload: body.payload,
        enc: body.enc,
        sig: body.sig,
    };
    validate_envelope(&env)?;
    Ok(env)
}

/// Plaintext sealed inside `enc` for a thread.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, EncodeError> {
    wire_options()
        .serialize(payload)
        .map_err(|e| EncodeError::Serialize(e.to_string()))
}

/// Inverse of [`encode_payload`]; checks the type's required fields.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, DecodeError> {
    let payload: Payload = wire_options()
        .deserialize(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if let Some(field) = payload.missing_field() {
        return Err(DecodeError::MissingField {
            message_type: payload.message_type(),
            field,
        });
    }
    Ok(payload)
}
