// Message types: the envelope that crosses the mesh

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest hop budget an envelope may declare.
pub const MAX_TTL: u8 = 8;

/// Decimal places kept when a location is coarsened for lean frames.
pub const COARSE_LOCATION_DECIMALS: i32 = 2;

/// Accuracy reported for a coarsened location, in metres.
pub const COARSE_LOCATION_ACCURACY_M: f32 = 1_100.0;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// What kind of message this is.
///
/// The type decides which payload fields are required and supplies the
/// default triage priority, hop budget and maximum age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Someone needs rescue or medical help
    Help,
    /// "I am safe" status ping
    Safe,
    /// Offer or request of supplies
    Resource,
    /// Presence beacon
    Ping,
    /// Acknowledgement of another envelope
    Ack,
    /// Announces a new record in the evidence ledger
    EvidenceNotice,
    /// Earthquake early warning, propagated on the fast path
    EarlyWarning,
    /// Short free-text chat line
    Chat,
    /// Location beacon
    Position,
    /// Handshake announcement for a pairwise encrypted thread
    SessionInit,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Help,
        MessageType::Safe,
        MessageType::Resource,
        MessageType::Ping,
        MessageType::Ack,
        MessageType::EvidenceNotice,
        MessageType::EarlyWarning,
        MessageType::Chat,
        MessageType::Position,
        MessageType::SessionInit,
    ];

    /// Single-byte tag written in the frame header.
    pub fn wire_tag(self) -> u8 {
        match self {
            MessageType::Help => 1,
            MessageType::Safe => 2,
            MessageType::Resource => 3,
            MessageType::Ping => 4,
            MessageType::Ack => 5,
            MessageType::EvidenceNotice => 6,
            MessageType::EarlyWarning => 7,
            MessageType::Chat => 8,
            MessageType::Position => 9,
            MessageType::SessionInit => 10,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.wire_tag() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Help => "HELP",
            MessageType::Safe => "SAFE",
            MessageType::Resource => "RESOURCE",
            MessageType::Ping => "PING",
            MessageType::Ack => "ACK",
            MessageType::EvidenceNotice => "EVIDENCE_NOTICE",
            MessageType::EarlyWarning => "EARLY_WARNING",
            MessageType::Chat => "CHAT",
            MessageType::Position => "POSITION",
            MessageType::SessionInit => "SESSION_INIT",
        }
    }

    /// Triage priority, lower is more urgent (0 = critical).
    pub fn default_priority(self) -> u8 {
        match self {
            MessageType::EarlyWarning => 0,
            MessageType::Help => 1,
            MessageType::Safe | MessageType::Ack => 2,
            MessageType::Resource | MessageType::EvidenceNotice | MessageType::SessionInit => 3,
            MessageType::Chat | MessageType::Position => 4,
            MessageType::Ping => 5,
        }
    }

    /// Default hop budget.
    pub fn default_ttl(self) -> u8 {
        match self {
            MessageType::EarlyWarning => MAX_TTL,
            MessageType::Help | MessageType::Safe | MessageType::Resource => 6,
            MessageType::Ack | MessageType::EvidenceNotice | MessageType::SessionInit => 6,
            MessageType::Chat => 4,
            MessageType::Position => 3,
            MessageType::Ping => 2,
        }
    }

    /// Maximum age before an envelope of this type stops being forwarded.
    pub fn max_age_ms(self) -> u64 {
        match self {
            MessageType::EarlyWarning => 10 * MINUTE_MS,
            MessageType::Help | MessageType::Safe => 6 * HOUR_MS,
            MessageType::Resource => 12 * HOUR_MS,
            MessageType::EvidenceNotice | MessageType::SessionInit => 24 * HOUR_MS,
            MessageType::Ack | MessageType::Chat => HOUR_MS,
            MessageType::Position => 15 * MINUTE_MS,
            MessageType::Ping => 30 * MINUTE_MS,
        }
    }

    /// Emergency classes are never fully blocked by power policy.
    pub fn is_emergency(self) -> bool {
        matches!(self, MessageType::Help | MessageType::EarlyWarning)
    }

    /// Fast-path classes jump the queue and trigger burst mode.
    pub fn is_fast_path(self) -> bool {
        matches!(self, MessageType::EarlyWarning)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown message type: {}", s))
    }
}

/// Geographic position attached to an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy in metres, if known
    pub accuracy_m: Option<f32>,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f32) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Round to a coarse grid for lean frames.
    pub fn coarsened(&self) -> Location {
        let factor = 10f64.powi(COARSE_LOCATION_DECIMALS);
        Location {
            lat: (self.lat * factor).round() / factor,
            lon: (self.lon * factor).round() / factor,
            accuracy_m: Some(
                self.accuracy_m
                    .map_or(COARSE_LOCATION_ACCURACY_M, |a| a.max(COARSE_LOCATION_ACCURACY_M)),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpPayload {
    pub under_rubble: bool,
    pub injured: bool,
    pub people_count: u16,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafePayload {
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePayload {
    pub resource_type: String,
    pub qty: u32,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub battery_percent: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the envelope being acknowledged
    pub ack_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceNoticePayload {
    /// BLAKE3 hash of the new ledger record (32 bytes)
    pub record_hash: Vec<u8>,
    /// Ledger chain head after appending the record (32 bytes)
    pub chain_head: Vec<u8>,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyWarningPayload {
    pub magnitude: f32,
    /// Nullable by design: feeds often omit depth
    pub depth_km: Option<f32>,
    pub epicenter: Option<Location>,
    /// Issuer timestamp of the warning (ms epoch)
    pub issued_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPayload {
    pub heading_deg: Option<u16>,
    pub tags: Vec<String>,
}

/// Handshake announcement: lets the responder derive the same session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInitPayload {
    /// Responder's Ed25519 identity key
    pub recipient: [u8; 32],
    pub thread_id: String,
    /// Initiator's ephemeral X25519 public key
    pub ephemeral_public: [u8; 32],
    /// Initiator's first ratchet public key
    pub ratchet_public: [u8; 32],
}

/// Type-specific body of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Help(HelpPayload),
    Safe(SafePayload),
    Resource(ResourcePayload),
    Ping(PingPayload),
    Ack(AckPayload),
    EvidenceNotice(EvidenceNoticePayload),
    EarlyWarning(EarlyWarningPayload),
    Chat(ChatPayload),
    Position(PositionPayload),
    SessionInit(SessionInitPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Help(_) => MessageType::Help,
            Payload::Safe(_) => MessageType::Safe,
            Payload::Resource(_) => MessageType::Resource,
            Payload::Ping(_) => MessageType::Ping,
            Payload::Ack(_) => MessageType::Ack,
            Payload::EvidenceNotice(_) => MessageType::EvidenceNotice,
            Payload::EarlyWarning(_) => MessageType::EarlyWarning,
            Payload::Chat(_) => MessageType::Chat,
            Payload::Position(_) => MessageType::Position,
            Payload::SessionInit(_) => MessageType::SessionInit,
        }
    }

    /// Free-text note, for the types that carry one.
    pub fn note(&self) -> Option<&str> {
        match self {
            Payload::Help(p) => p.note.as_deref(),
            Payload::Safe(p) => p.note.as_deref(),
            Payload::Resource(p) => p.note.as_deref(),
            _ => None,
        }
    }

    /// Drop the free-text note. Returns true if one was present.
    pub fn strip_note(&mut self) -> bool {
        let note = match self {
            Payload::Help(p) => &mut p.note,
            Payload::Safe(p) => &mut p.note,
            Payload::Resource(p) => &mut p.note,
            _ => return false,
        };
        note.take().is_some()
    }

    /// Name of the first required field that is missing or empty.
    pub fn missing_field(&self) -> Option<&'static str> {
        match self {
            Payload::Help(p) if p.people_count == 0 => Some("people_count"),
            Payload::Resource(p) if p.resource_type.trim().is_empty() => Some("resource_type"),
            Payload::Resource(p) if p.qty == 0 => Some("qty"),
            Payload::Ack(p) if p.ack_id.is_empty() => Some("ack_id"),
            Payload::EvidenceNotice(p) if p.record_hash.len() != 32 => Some("record_hash"),
            Payload::EvidenceNotice(p) if p.chain_head.len() != 32 => Some("chain_head"),
            Payload::EarlyWarning(p) if !p.magnitude.is_finite() => Some("magnitude"),
            Payload::Chat(p) if p.text.is_empty() => Some("text"),
            Payload::SessionInit(p) if p.thread_id.is_empty() => Some("thread_id"),
            _ => None,
        }
    }
}

/// End-to-end encrypted body, readable only by the two ends of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub thread_id: String,
    /// Sender's current ratchet public key
    pub ratchet_public: [u8; 32],
    /// Position in the sender's current sending chain
    pub counter: u32,
    /// XChaCha20-Poly1305 nonce
    pub nonce: [u8; 24],
    /// Encrypted bincode of the inner `Payload`
    pub ciphertext: Vec<u8>,
}

/// The unit of exchange on the mesh.
///
/// An envelope is immutable once signed. Forwarding produces a new value
/// with `hop + 1` and the same `id`, so deduplication still recognises it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique id, the identity used for deduplication
    pub id: String,
    pub message_type: MessageType,
    /// Creation time on the sender (ms epoch)
    pub ts: u64,
    pub loc: Option<Location>,
    /// Lower is more urgent
    pub priority: u8,
    /// Hop budget, at most `MAX_TTL`
    pub ttl: u8,
    /// Hops traversed so far
    pub hop: u8,
    /// Sender's Ed25519 identity key
    pub sender: [u8; 32],
    /// Plaintext body; absent when `enc` is set
    pub payload: Option<Payload>,
    /// Encrypted body for a pairwise thread
    pub enc: Option<SealedPayload>,
    /// Detached Ed25519 signature over the canonical encoding (64 bytes)
    pub sig: Option<Vec<u8>>,
}

impl Envelope {
    /// Create an unsigned plaintext envelope with the type's defaults.
    pub fn new(sender: [u8; 32], payload: Payload, ts: u64) -> Self {
        let message_type = payload.message_type();
        Self {
            id: Self::derive_id(&sender, ts, message_type),
            message_type,
            ts,
            loc: None,
            priority: message_type.default_priority(),
            ttl: message_type.default_ttl(),
            hop: 0,
            sender,
            payload: Some(payload),
            enc: None,
            sig: None,
        }
    }

    pub fn with_location(mut self, loc: Location) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Content-derived id: base58 of BLAKE3(sender ‖ ts ‖ type ‖ salt), 16 bytes.
    pub fn derive_id(sender: &[u8; 32], ts: u64, message_type: MessageType) -> String {
        let mut salt = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let mut hasher = blake3::Hasher::new();
        hasher.update(sender);
        hasher.update(&ts.to_le_bytes());
        hasher.update(&[message_type.wire_tag()]);
        hasher.update(&salt);
        let digest = hasher.finalize();
        bs58::encode(&digest.as_bytes()[..16]).into_string()
    }

    /// The copy that goes back on air after one more hop.
    pub fn forwarded(&self) -> Envelope {
        let mut next = self.clone();
        next.hop = self.hop.saturating_add(1);
        next
    }

    /// No hop budget left for another transmission.
    pub fn is_hop_exhausted(&self) -> bool {
        self.hop >= self.ttl
    }

    pub fn is_encrypted(&self) -> bool {
        self.enc.is_some()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.enc.as_ref().map(|e| e.thread_id.as_str())
    }

    pub fn note(&self) -> Option<&str> {
        self.payload.as_ref().and_then(|p| p.note())
    }

    /// Short hex of the sender key for logs.
    pub fn sender_short(&self) -> String {
        hex::encode(&self.sender[..4])
    }
}
