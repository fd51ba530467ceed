//! Monotonic, sortable, node-qualified event identifiers.
//!
//! The printed form is `<timestamp_ns>_<sequence_in_tick>_<node_id>` with the
//! timestamp zero-padded to 19 digits and the per-tick sequence to 6, so that
//! byte-wise string comparison orders ids chronologically. The generator
//! clamps its clock so timestamps never move backwards within a process.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Per-tick sequence ceiling implied by the 6-digit printed form.
const MAX_TICK_SEQUENCE: u32 = 999_999;

/// Globally unique, chronologically sortable event identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    /// Nanoseconds since the Unix epoch at generation time.
    pub timestamp_ns: u64,
    /// Tie-breaker among ids generated within the same nanosecond tick.
    pub sequence: u32,
    /// Identifier of the generating process.
    pub node_id: String,
}

impl EventId {
    /// Construct an id from raw components.
    pub fn new(timestamp_ns: u64, sequence: u32, node_id: impl Into<String>) -> Self {
        Self {
            timestamp_ns,
            sequence,
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:019}_{:06}_{}",
            self.timestamp_ns, self.sequence, self.node_id
        )
    }
}

impl FromStr for EventId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '_');
        let (ts, seq, node) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ts), Some(seq), Some(node)) if !node.is_empty() => (ts, seq, node),
            _ => {
                return Err(EventError::InvalidEventId(format!(
                    "invalid event id format: {s}"
                )))
            }
        };
        let timestamp_ns = ts.parse::<u64>().map_err(|_| {
            EventError::InvalidEventId(format!("invalid event id timestamp: {ts}"))
        })?;
        let sequence = seq.parse::<u32>().map_err(|_| {
            EventError::InvalidEventId(format!("invalid event id sequence: {seq}"))
        })?;
        Ok(Self::new(timestamp_ns, sequence, node))
    }
}

//─────────────────────────────
//  Generator
//─────────────────────────────

#[derive(Debug)]
struct GeneratorState {
    last_timestamp_ns: u64,
    tick_sequence: u32,
}

/// Thread-safe generator producing strictly increasing [`EventId`]s.
#[derive(Debug)]
pub struct MonotonicIdGenerator {
    node_id: String,
    state: Mutex<GeneratorState>,
}

impl MonotonicIdGenerator {
    /// Create a generator for the given node.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(GeneratorState {
                last_timestamp_ns: now_ns(),
                tick_sequence: 0,
            }),
        }
    }

    /// Node identifier stamped onto every generated id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Produce the next id. Timestamps never go backwards; ids generated
    /// within the same tick are disambiguated by the tick sequence.
    pub fn generate(&self) -> EventId {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut now = now_ns().max(state.last_timestamp_ns);

        if now == state.last_timestamp_ns {
            if state.tick_sequence >= MAX_TICK_SEQUENCE {
                // Tick exhausted; advance the clamped clock by one nanosecond.
                now += 1;
                state.tick_sequence = 0;
            } else {
                state.tick_sequence += 1;
            }
        } else {
            state.tick_sequence = 0;
        }
        state.last_timestamp_ns = now;

        EventId::new(now, state.tick_sequence, self.node_id.clone())
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn formats_per_adr_003() {
        let id = EventId::new(1_692_900_000_123_456_789, 42, "test-node");
        assert_eq!(id.to_string(), "1692900000123456789_000042_test-node");
    }

    #[test]
    fn parses_round_trip() {
        let id = EventId::new(1_692_900_000_123_456_789, 42, "test-node");
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        // Unpadded legacy form parses too.
        let parsed: EventId = "1692900000123456789_42_test-node".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!("invalid-format".parse::<EventId>().is_err());
        assert!("123_456".parse::<EventId>().is_err());
        assert!("not-a-number_456_node".parse::<EventId>().is_err());
        assert!("123_not-a-number_node".parse::<EventId>().is_err());
    }

    #[test]
    fn node_id_may_contain_underscores() {
        let parsed: EventId = "100_5_node_with_underscores".parse().unwrap();
        assert_eq!(parsed.node_id, "node_with_underscores");
        assert_eq!(parsed.timestamp_ns, 100);
        assert_eq!(parsed.sequence, 5);
    }

    #[test]
    fn component_order_matches_string_order() {
        let earlier = EventId::new(100, 0, "node1");
        let later = EventId::new(200, 0, "node1");
        assert!(earlier < later);
        assert!(earlier.to_string() < later.to_string());

        let a = EventId::new(100, 1, "node1");
        let b = EventId::new(100, 2, "node1");
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn generator_is_strictly_increasing() {
        let generator = MonotonicIdGenerator::new("test-node");
        let mut previous = generator.generate();
        for _ in 0..10_000 {
            let next = generator.generate();
            assert!(previous < next, "{previous} !< {next}");
            previous = next;
        }
    }

    #[test]
    fn generator_stamps_node_id() {
        let generator = MonotonicIdGenerator::new("custom-node");
        assert_eq!(generator.generate().node_id, "custom-node");
    }

    proptest! {
        #[test]
        fn string_round_trip(ts in 0u64..4_000_000_000_000_000_000, seq in 0u32..1_000_000) {
            let id = EventId::new(ts, seq, "prop-node");
            let parsed: EventId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }

        #[test]
        fn string_order_is_chronological(
            ts_a in 0u64..4_000_000_000_000_000_000,
            seq_a in 0u32..1_000_000,
            ts_b in 0u64..4_000_000_000_000_000_000,
            seq_b in 0u32..1_000_000,
        ) {
            let a = EventId::new(ts_a, seq_a, "node");
            let b = EventId::new(ts_b, seq_b, "node");
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }
    }
}
