//! Replay: folding the log into state with a typed handler table.
//!
//! Replay is deterministic given the same event prefix. Snapshots capture a
//! reduced state at a specific sequence and only accelerate replay; they are
//! never authoritative over the log itself.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{decode_verified, Event, EventBackend, EventError, EventSigner, EventType};

/// Page size used when streaming the log during replay.
const REPLAY_BATCH: usize = 1024;

/// Typed map from event type to reducer function.
///
/// Replaces the original's reflection-driven handler registration with an
/// explicit table; unregistered event types are skipped.
pub struct ReplayHandlers<S> {
    handlers: HashMap<EventType, Box<dyn Fn(&mut S, &Event) + Send + Sync>>,
}

impl<S> Default for ReplayHandlers<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ReplayHandlers<S> {
    /// An empty handler table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a reducer for `event_type`, replacing any previous one.
    pub fn on(
        mut self,
        event_type: EventType,
        handler: impl Fn(&mut S, &Event) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(event_type, Box::new(handler));
        self
    }

    /// Apply one event to `state`; unregistered types are ignored.
    pub fn apply(&self, state: &mut S, event: &Event) {
        if let Some(handler) = self.handlers.get(&event.event_type) {
            handler(state, event);
        }
    }
}

/// Stream events in sequence order into `state`, starting after
/// `from_sequence` (pass 0 to replay the whole log).
///
/// Records failing signature verification are skipped and counted; the count
/// of skipped records is returned alongside the sequence reached.
pub async fn replay_events<S>(
    backend: &dyn EventBackend,
    signer: &EventSigner,
    from_sequence: u64,
    handlers: &ReplayHandlers<S>,
    state: &mut S,
) -> anyhow::Result<ReplayOutcome> {
    let mut next = from_sequence + 1;
    let mut applied = 0u64;
    let mut integrity_failures = 0u64;
    let mut last_applied = from_sequence;

    loop {
        let frames = backend.scan(next, REPLAY_BATCH).await?;
        if frames.is_empty() {
            break;
        }
        for frame in &frames {
            match decode_verified(signer, frame) {
                Ok(event) => {
                    last_applied = event.sequence.unwrap_or(last_applied);
                    handlers.apply(state, &event);
                    applied += 1;
                }
                Err(EventError::Integrity { .. }) => integrity_failures += 1,
                Err(e) => return Err(e.into()),
            }
            next += 1;
        }
    }

    Ok(ReplayOutcome {
        applied,
        integrity_failures,
        last_sequence: last_applied,
    })
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Events folded into state.
    pub applied: u64,
    /// Records skipped due to signature failures.
    pub integrity_failures: u64,
    /// Highest sequence applied.
    pub last_sequence: u64,
}

//─────────────────────────────
//  Snapshots
//─────────────────────────────

/// A reduced state captured at a specific sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot identifier.
    pub snapshot_id: String,
    /// Sequence the state reduces up to, inclusive.
    pub sequence: u64,
    /// MessagePack-encoded reduced state.
    pub state: Vec<u8>,
    /// Caller-supplied annotations.
    pub metadata: BTreeMap<String, String>,
    /// Hex HMAC over (snapshot_id, sequence, state).
    pub hmac: String,
}

impl Snapshot {
    /// Capture `state` at `sequence`, signing the snapshot.
    pub fn capture<S: Serialize>(
        signer: &EventSigner,
        snapshot_id: impl Into<String>,
        sequence: u64,
        state: &S,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, EventError> {
        let snapshot_id = snapshot_id.into();
        let state = rmp_serde::to_vec_named(state).map_err(|e| EventError::Codec(e.to_string()))?;
        let hmac = signer.sign_detached(&[
            snapshot_id.as_bytes(),
            &sequence.to_be_bytes(),
            &state,
        ]);
        Ok(Self {
            snapshot_id,
            sequence,
            state,
            metadata,
            hmac,
        })
    }

    /// Verify the signature and decode the reduced state.
    pub fn restore<S: DeserializeOwned>(&self, signer: &EventSigner) -> Result<S, EventError> {
        let verified = signer.verify_detached(
            &[
                self.snapshot_id.as_bytes(),
                &self.sequence.to_be_bytes(),
                &self.state,
            ],
            &self.hmac,
        );
        if !verified {
            return Err(EventError::Integrity {
                event_id: format!("snapshot:{}", self.snapshot_id),
                sequence: Some(self.sequence),
            });
        }
        rmp_serde::from_slice(&self.state).map_err(|e| EventError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventId;
    use lighthouse_types::AgentId;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct CommandTally {
        received: u64,
        blocked: u64,
    }

    fn handlers() -> ReplayHandlers<CommandTally> {
        ReplayHandlers::new()
            .on(EventType::CommandReceived, |s: &mut CommandTally, _| s.received += 1)
            .on(EventType::CommandBlocked, |s: &mut CommandTally, _| s.blocked += 1)
    }

    fn event(event_type: EventType) -> Event {
        Event::new(
            EventId::new(1, 0, "test-node"),
            event_type,
            "agent:alice",
            json!({}),
            AgentId::new("alice").unwrap(),
        )
    }

    #[test]
    fn apply_dispatches_by_type() {
        let table = handlers();
        let mut tally = CommandTally::default();
        table.apply(&mut tally, &event(EventType::CommandReceived));
        table.apply(&mut tally, &event(EventType::CommandReceived));
        table.apply(&mut tally, &event(EventType::CommandBlocked));
        // Unregistered type is a no-op.
        table.apply(&mut tally, &event(EventType::AgentHeartbeat));
        assert_eq!(
            tally,
            CommandTally {
                received: 2,
                blocked: 1
            }
        );
    }

    #[test]
    fn snapshot_round_trip() {
        let signer = EventSigner::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let state = CommandTally {
            received: 7,
            blocked: 2,
        };
        let snapshot =
            Snapshot::capture(&signer, "snap-1", 42, &state, BTreeMap::new()).unwrap();
        assert_eq!(snapshot.sequence, 42);
        let restored: CommandTally = snapshot.restore(&signer).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn tampered_snapshot_fails_restore() {
        let signer = EventSigner::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let mut snapshot = Snapshot::capture(
            &signer,
            "snap-1",
            42,
            &CommandTally::default(),
            BTreeMap::new(),
        )
        .unwrap();
        snapshot.sequence = 43;
        assert!(snapshot.restore::<CommandTally>(&signer).is_err());
    }
}
