// Message module: envelope model and wire codec

pub mod codec;
pub mod types;

pub use codec::{
    canonical_signing_bytes, decode_envelope, decode_payload, encode_envelope, encode_payload,
    validate_envelope, DecodeError, EncodeError, MAX_ENVELOPE_SIZE, MAX_NOTE_LEN, WIRE_VERSION,
};
pub use types::{
    AckPayload, ChatPayload, EarlyWarningPayload, Envelope, EvidenceNoticePayload, HelpPayload,
    Location, MessageType, Payload, PingPayload, PositionPayload, ResourcePayload, SafePayload,
    SealedPayload, SessionInitPayload, MAX_TTL,
};
