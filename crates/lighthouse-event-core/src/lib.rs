#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-event-core** – Core event model and storage abstractions.
//!
//! This crate defines the event primitives shared across the Lighthouse
//! workspace: the [`Event`] record and its closed [`EventType`] enumeration,
//! the canonical MessagePack encoding, HMAC signing and verification, query
//! and replay models, and the [`EventBackend`] contract that storage drivers
//! implement in separate crates.
//!
//! It sits at the core layer and performs no I/O of its own.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use lighthouse_types::{
    json_depth, AgentId, MAX_EVENT_SIZE_BYTES, MAX_METADATA_ENTRIES, MAX_PAYLOAD_DEPTH,
    MAX_STRING_LEN,
};

mod id;
mod query;
mod replay;

pub use id::{EventId, MonotonicIdGenerator};
pub use query::{EventFilter, EventQuery, QueryResult, SortKey};
pub use replay::{replay_events, ReplayHandlers, ReplayOutcome, Snapshot};

type HmacSha256 = Hmac<Sha256>;

/// Minimum length accepted for the store's signing key.
pub const MIN_SECRET_LEN: usize = 32;

//─────────────────────────────
//  Event type enumeration
//─────────────────────────────

/// Closed set of event kinds recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A tool invocation arrived at the bridge.
    CommandReceived,
    /// The speed layer produced a ruling.
    CommandValidated,
    /// The agent reported the command as executed.
    CommandExecuted,
    /// The pipeline refused the command.
    CommandBlocked,
    /// The shadow filesystem projection changed.
    ShadowUpdated,
    /// An agent registered with the platform.
    AgentRegistered,
    /// Agent liveness signal.
    AgentHeartbeat,
    /// A session was issued.
    SessionStarted,
    /// An elicitation was created.
    ElicitationCreated,
    /// An elicitation received its terminal response.
    ElicitationResponded,
    /// An elicitation expired without a response.
    ElicitationExpired,
    /// A replay snapshot was captured.
    SnapshotCreated,
    /// The platform started.
    SystemStarted,
    /// The platform stopped.
    SystemStopped,
    /// An integrity or impersonation attempt was detected.
    SecurityIncident,
}

//─────────────────────────────
//  Event record
//─────────────────────────────

/// The atomic unit of the append-only log.
///
/// `sequence` is `None` until the store assigns it at append time; once
/// written an event is immutable. The `hmac` field carries the hex keyed
/// signature over the canonical bytes of the record with `hmac` cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique, sortable identifier.
    pub event_id: EventId,
    /// Dense, store-assigned position in the global log.
    pub sequence: Option<u64>,
    /// Kind of the event.
    pub event_type: EventType,
    /// Logical stream this event belongs to, e.g. `"agent:alice"`.
    pub aggregate_id: String,
    /// Optional classification of the aggregate, e.g. `"agent"`.
    pub aggregate_type: Option<String>,
    /// Structured payload.
    pub data: Value,
    /// Small auxiliary map; BTreeMap keeps the canonical bytes stable.
    pub metadata: BTreeMap<String, String>,
    /// Authenticated principal that caused the event.
    pub source_agent: AgentId,
    /// Wall clock at creation, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Payload schema version.
    pub schema_version: u32,
    /// Hex HMAC-SHA256 over the canonical bytes, set at append time.
    pub hmac: Option<String>,
}

impl Event {
    /// Build an unsigned, unsequenced event.
    pub fn new(
        event_id: EventId,
        event_type: EventType,
        aggregate_id: impl Into<String>,
        data: Value,
        source_agent: AgentId,
    ) -> Self {
        let timestamp_ns = event_id.timestamp_ns;
        Self {
            event_id,
            sequence: None,
            event_type,
            aggregate_id: aggregate_id.into(),
            aggregate_type: None,
            data,
            metadata: BTreeMap::new(),
            source_agent,
            timestamp_ns,
            schema_version: 1,
            hmac: None,
        }
    }

    /// Set the aggregate classification.
    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Canonical MessagePack encoding with the signature field cleared.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, EventError> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        rmp_serde::to_vec_named(&unsigned).map_err(|e| EventError::Codec(e.to_string()))
    }

    /// Serialized size of the signed record.
    pub fn size_bytes(&self) -> Result<usize, EventError> {
        Ok(self.canonical_bytes()?.len())
    }
}

//─────────────────────────────
//  Payload validation
//─────────────────────────────

/// String fragments never accepted inside payload fields.
const DANGEROUS_FRAGMENTS: &[&str] = &["<script", "javascript:", "data:text/html"];

/// Validate an event against the platform's structural limits.
///
/// Checks total serialized size, payload nesting depth, metadata bounds, and
/// scans every string field for NUL bytes and known-dangerous fragments.
pub fn validate_event(event: &Event) -> Result<(), EventError> {
    let size = event.size_bytes()?;
    if size > MAX_EVENT_SIZE_BYTES {
        return Err(EventError::PayloadTooLarge {
            size,
            limit: MAX_EVENT_SIZE_BYTES,
        });
    }
    if json_depth(&event.data) > MAX_PAYLOAD_DEPTH {
        return Err(EventError::Validation(format!(
            "payload nesting exceeds depth {MAX_PAYLOAD_DEPTH}"
        )));
    }
    if event.metadata.len() > MAX_METADATA_ENTRIES {
        return Err(EventError::Validation(format!(
            "metadata has {} entries, limit {MAX_METADATA_ENTRIES}",
            event.metadata.len()
        )));
    }
    check_string(&event.aggregate_id, "aggregate_id")?;
    for (key, value) in &event.metadata {
        check_string(key, "metadata key")?;
        check_string(value, "metadata value")?;
    }
    check_value(&event.data)?;
    Ok(())
}

fn check_value(value: &Value) -> Result<(), EventError> {
    match value {
        Value::String(s) => check_string(s, "payload field"),
        Value::Array(items) => items.iter().try_for_each(check_value),
        Value::Object(map) => {
            for (key, value) in map {
                check_string(key, "payload key")?;
                check_value(value)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_string(s: &str, field: &str) -> Result<(), EventError> {
    if s.len() > MAX_STRING_LEN {
        return Err(EventError::Validation(format!(
            "{field} length {} exceeds limit {MAX_STRING_LEN}",
            s.len()
        )));
    }
    if s.contains('\0') {
        return Err(EventError::Validation(format!("{field} contains null bytes")));
    }
    let lowered = s.to_lowercase();
    for fragment in DANGEROUS_FRAGMENTS {
        if lowered.contains(fragment) {
            return Err(EventError::Validation(format!(
                "{field} contains dangerous pattern {fragment:?}"
            )));
        }
    }
    Ok(())
}

//─────────────────────────────
//  Signing
//─────────────────────────────

/// Signs and verifies events with the store's HMAC key.
#[derive(Clone)]
pub struct EventSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for EventSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output.
        f.debug_struct("EventSigner").finish_non_exhaustive()
    }
}

impl EventSigner {
    /// Create a signer; the key must be at least [`MIN_SECRET_LEN`] bytes.
    pub fn new(key: &[u8]) -> Result<Self, EventError> {
        if key.len() < MIN_SECRET_LEN {
            return Err(EventError::Validation(format!(
                "signing key must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self { key: key.to_vec() })
    }

    fn mac(&self) -> HmacSha256 {
        // Key length was validated in the constructor; HMAC accepts any length.
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length")
    }

    /// Compute and attach the signature for `event`.
    pub fn sign(&self, event: &mut Event) -> Result<(), EventError> {
        let bytes = event.canonical_bytes()?;
        let mut mac = self.mac();
        mac.update(&bytes);
        event.hmac = Some(hex::encode(mac.finalize().into_bytes()));
        Ok(())
    }

    /// Verify the attached signature in constant time.
    pub fn verify(&self, event: &Event) -> Result<bool, EventError> {
        let Some(stored) = &event.hmac else {
            return Ok(false);
        };
        let Ok(stored_bytes) = hex::decode(stored) else {
            return Ok(false);
        };
        let bytes = event.canonical_bytes()?;
        let mut mac = self.mac();
        mac.update(&bytes);
        Ok(mac.verify_slice(&stored_bytes).is_ok())
    }

    /// Sign a detached payload, e.g. elicitation response bindings.
    pub fn sign_detached(&self, parts: &[&[u8]]) -> String {
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
            mac.update(&[0u8]);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a detached signature in constant time.
    pub fn verify_detached(&self, parts: &[&[u8]], signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
            mac.update(&[0u8]);
        }
        mac.verify_slice(&signature).is_ok()
    }
}

//─────────────────────────────
//  Wire codec
//─────────────────────────────

/// Encode a signed event for storage.
pub fn encode_signed(event: &Event) -> Result<Vec<u8>, EventError> {
    if event.hmac.is_none() {
        return Err(EventError::Validation("event is not signed".to_string()));
    }
    rmp_serde::to_vec_named(event).map_err(|e| EventError::Codec(e.to_string()))
}

/// Decode a stored frame without verifying its signature.
pub fn decode_frame(bytes: &[u8]) -> Result<Event, EventError> {
    rmp_serde::from_slice(bytes).map_err(|e| EventError::Codec(e.to_string()))
}

/// Decode a stored frame and verify its signature.
///
/// Returns [`EventError::Integrity`] when the signature is missing or does
/// not match, so callers can skip and count the record rather than serve it.
pub fn decode_verified(signer: &EventSigner, bytes: &[u8]) -> Result<Event, EventError> {
    let event = decode_frame(bytes)?;
    if signer.verify(&event)? {
        Ok(event)
    } else {
        Err(EventError::Integrity {
            event_id: event.event_id.to_string(),
            sequence: event.sequence,
        })
    }
}

//─────────────────────────────
//  Durability policy
//─────────────────────────────

/// How aggressively backends flush appended records to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// fsync after every record.
    PerWrite,
    /// fsync once per batch.
    PerBatch,
    /// fsync on a timer, in milliseconds.
    Interval(u64),
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        Self::PerWrite
    }
}

//─────────────────────────────
//  Storage backend trait
//─────────────────────────────

/// A signed event frame ready for storage, with the columns drivers may
/// index without decoding the opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedFrame {
    /// Canonical signed record bytes.
    pub bytes: Vec<u8>,
    /// Aggregate stream of the record.
    pub aggregate_id: String,
    /// Printed event type of the record.
    pub event_type: String,
    /// Event timestamp in nanoseconds.
    pub timestamp_ns: u64,
}

impl SealedFrame {
    /// Seal a signed event for handoff to a backend.
    pub fn seal(event: &Event) -> Result<Self, EventError> {
        Ok(Self {
            bytes: encode_signed(event)?,
            aggregate_id: event.aggregate_id.clone(),
            event_type: serde_json::to_string(&event.event_type)
                .map_err(|e| EventError::Codec(e.to_string()))?
                .trim_matches('"')
                .to_string(),
            timestamp_ns: event.timestamp_ns,
        })
    }
}

/// Abstraction over an append-only sequence of signed event frames.
///
/// Drivers store opaque frames keyed by the dense sequence the store service
/// assigns; encoding, signing, and verification happen above this trait.
/// Both shipped drivers (segmented log, SQLite WAL) implement identical
/// semantics including crash recovery to the highest intact sequence.
#[async_trait]
pub trait EventBackend: Send + Sync {
    /// Append one frame at `sequence`. The frame must become durable per the
    /// backend's fsync policy before the call returns, or the call must fail
    /// without leaving a partially visible record.
    async fn append(&self, sequence: u64, frame: &SealedFrame) -> anyhow::Result<()>;

    /// Append a contiguous batch starting at `first_sequence`, atomically:
    /// either every frame is durable or none is.
    async fn append_batch(&self, first_sequence: u64, frames: &[SealedFrame])
        -> anyhow::Result<()>;

    /// Read the frame at `sequence`, if present.
    async fn read(&self, sequence: u64) -> anyhow::Result<Option<Vec<u8>>>;

    /// Read up to `limit` frames starting at `from_sequence`, in order.
    async fn scan(&self, from_sequence: u64, limit: usize) -> anyhow::Result<Vec<Vec<u8>>>;

    /// Highest durable sequence, or 0 when the log is empty.
    async fn tail_sequence(&self) -> anyhow::Result<u64>;

    /// Force pending writes to stable storage.
    async fn sync(&self) -> anyhow::Result<()>;

    /// Bytes of stable storage in use.
    async fn disk_usage(&self) -> anyhow::Result<u64>;

    /// Number of storage segments (1 for single-file drivers).
    async fn segment_count(&self) -> anyhow::Result<usize>;
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors produced by the event core.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// An event id string did not parse.
    #[error("{0}")]
    InvalidEventId(String),
    /// Canonical encoding or decoding failed.
    #[error("event codec failure: {0}")]
    Codec(String),
    /// The event violated a structural limit.
    #[error("event validation failed: {0}")]
    Validation(String),
    /// The event exceeds the single-record size cap.
    #[error("event size {size} exceeds limit {limit}")]
    PayloadTooLarge {
        /// Serialized size observed.
        size: usize,
        /// Configured cap.
        limit: usize,
    },
    /// A stored record failed signature verification.
    #[error("integrity failure on event {event_id} (sequence {sequence:?})")]
    Integrity {
        /// Printed id of the offending record.
        event_id: String,
        /// Stored sequence, if assigned.
        sequence: Option<u64>,
    },
}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        decode_frame, decode_verified, encode_signed, replay_events, validate_event, Event,
        EventBackend, EventError, EventFilter, EventId, EventQuery, EventSigner, EventType,
        FsyncPolicy, MonotonicIdGenerator, QueryResult, ReplayHandlers, ReplayOutcome,
        SealedFrame, Snapshot, SortKey,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(name: &str) -> AgentId {
        AgentId::new(name).unwrap()
    }

    fn sample_event() -> Event {
        Event::new(
            EventId::new(1_000, 0, "test-node"),
            EventType::CommandReceived,
            "agent:alice",
            json!({"command": "ls -la"}),
            agent("alice"),
        )
        .with_aggregate_type("agent")
        .with_metadata("editor", "vim")
    }

    fn signer() -> EventSigner {
        EventSigner::new(b"0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn signer_rejects_short_keys() {
        assert!(EventSigner::new(b"short").is_err());
    }

    #[test]
    fn canonical_bytes_ignore_signature() {
        let mut event = sample_event();
        let before = event.canonical_bytes().unwrap();
        signer().sign(&mut event).unwrap();
        assert_eq!(event.canonical_bytes().unwrap(), before);
    }

    #[test]
    fn sign_verify_round_trip() {
        let signer = signer();
        let mut event = sample_event();
        signer.sign(&mut event).unwrap();
        assert!(signer.verify(&event).unwrap());

        let encoded = encode_signed(&event).unwrap();
        let decoded = decode_verified(&signer, &encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let signer = signer();
        let mut event = sample_event();
        signer.sign(&mut event).unwrap();

        event.data = json!({"command": "rm -rf /"});
        assert!(!signer.verify(&event).unwrap());

        let err = decode_verified(&signer, &encode_signed(&event).unwrap()).unwrap_err();
        assert!(matches!(err, EventError::Integrity { .. }));
    }

    #[test]
    fn tampered_frame_bytes_fail_verification() {
        let signer = signer();
        let mut event = sample_event();
        signer.sign(&mut event).unwrap();
        let mut encoded = encode_signed(&event).unwrap();

        // Flip one byte somewhere in the middle of the frame.
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;
        match decode_verified(&signer, &encoded) {
            Err(EventError::Integrity { .. }) | Err(EventError::Codec(_)) => {}
            other => panic!("expected integrity or codec failure, got {other:?}"),
        }
    }

    #[test]
    fn wrong_key_fails_verification() {
        let mut event = sample_event();
        signer().sign(&mut event).unwrap();

        let other = EventSigner::new(b"ffffffffffffffffffffffffffffffff").unwrap();
        assert!(!other.verify(&event).unwrap());
    }

    #[test]
    fn validation_rejects_null_bytes_and_depth() {
        let mut event = sample_event();
        event.data = json!({"command": "ls\0-la"});
        assert!(validate_event(&event).is_err());

        let mut nested = json!("leaf");
        for _ in 0..12 {
            nested = json!({ "inner": nested });
        }
        event.data = nested;
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn validation_rejects_dangerous_fragments() {
        let mut event = sample_event();
        event.data = json!({"html": "<SCRIPT>alert(1)</script>"});
        assert!(validate_event(&event).is_err());
    }

    #[test]
    fn validation_accepts_ordinary_events() {
        assert!(validate_event(&sample_event()).is_ok());
    }

    #[test]
    fn detached_signatures_bind_all_parts() {
        let signer = signer();
        let sig = signer.sign_detached(&[b"elicit-1", b"bob", b"{\"answer\":\"42\"}"]);
        assert!(signer.verify_detached(&[b"elicit-1", b"bob", b"{\"answer\":\"42\"}"], &sig));
        assert!(!signer.verify_detached(&[b"elicit-1", b"mallory", b"{\"answer\":\"42\"}"], &sig));
        assert!(!signer.verify_detached(&[b"elicit-2", b"bob", b"{\"answer\":\"42\"}"], &sig));
    }
}
