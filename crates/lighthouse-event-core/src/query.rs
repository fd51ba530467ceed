//! Query model for range reads over the log.

use serde::{Deserialize, Serialize};

use lighthouse_types::AgentId;

use crate::{Event, EventType};

/// Hard ceiling on a single query page.
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Conjunctive filter over events; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Match any of these event types.
    pub event_types: Option<Vec<EventType>>,
    /// Match any of these aggregate ids.
    pub aggregate_ids: Option<Vec<String>>,
    /// Match any of these source agents.
    pub source_agents: Option<Vec<AgentId>>,
    /// Only events with sequence strictly greater than this.
    pub after_sequence: Option<u64>,
    /// Only events with sequence strictly less than this.
    pub before_sequence: Option<u64>,
    /// Only events at or after this timestamp (ns).
    pub after_timestamp_ns: Option<u64>,
    /// Only events at or before this timestamp (ns).
    pub before_timestamp_ns: Option<u64>,
}

impl EventFilter {
    /// Whether `event` satisfies every set predicate.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(aggregates) = &self.aggregate_ids {
            if !aggregates.contains(&event.aggregate_id) {
                return false;
            }
        }
        if let Some(agents) = &self.source_agents {
            if !agents.contains(&event.source_agent) {
                return false;
            }
        }
        let sequence = event.sequence.unwrap_or(0);
        if let Some(after) = self.after_sequence {
            if sequence <= after {
                return false;
            }
        }
        if let Some(before) = self.before_sequence {
            if sequence >= before {
                return false;
            }
        }
        if let Some(after) = self.after_timestamp_ns {
            if event.timestamp_ns < after {
                return false;
            }
        }
        if let Some(before) = self.before_timestamp_ns {
            if event.timestamp_ns > before {
                return false;
            }
        }
        true
    }
}

/// Sort key for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Order by store-assigned sequence.
    #[default]
    Sequence,
    /// Order by event timestamp.
    Timestamp,
}

/// A paged, sorted query over the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    /// Row filter.
    pub filter: EventFilter,
    /// Rows to skip after filtering and sorting.
    pub offset: usize,
    /// Page size, capped at [`MAX_QUERY_LIMIT`].
    pub limit: usize,
    /// Sort key.
    pub sort_by: SortKey,
    /// Ascending or descending.
    pub ascending: bool,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            filter: EventFilter::default(),
            offset: 0,
            limit: 100,
            sort_by: SortKey::Sequence,
            ascending: true,
        }
    }
}

impl EventQuery {
    /// A query matching everything with the given page size.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Effective page size after applying the hard ceiling.
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_QUERY_LIMIT)
    }

    /// Sort `events` in place per this query.
    pub fn sort(&self, events: &mut [Event]) {
        match self.sort_by {
            SortKey::Sequence => events.sort_by_key(|e| e.sequence.unwrap_or(0)),
            SortKey::Timestamp => {
                events.sort_by_key(|e| (e.timestamp_ns, e.sequence.unwrap_or(0)))
            }
        }
        if !self.ascending {
            events.reverse();
        }
    }
}

/// One page of query output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// The matching page.
    pub events: Vec<Event>,
    /// Total matches before pagination.
    pub total_count: usize,
    /// Whether further pages exist.
    pub has_more: bool,
    /// Server-side execution time.
    pub execution_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventId;
    use serde_json::json;

    fn event(seq: u64, event_type: EventType, aggregate: &str) -> Event {
        let mut e = Event::new(
            EventId::new(seq * 10, 0, "test-node"),
            event_type,
            aggregate,
            json!({}),
            AgentId::new("alice").unwrap(),
        );
        e.sequence = Some(seq);
        e
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&event(1, EventType::CommandReceived, "agent:alice")));
    }

    #[test]
    fn filters_compose_conjunctively() {
        let filter = EventFilter {
            event_types: Some(vec![EventType::CommandReceived]),
            aggregate_ids: Some(vec!["agent:alice".to_string()]),
            after_sequence: Some(1),
            ..Default::default()
        };
        assert!(filter.matches(&event(2, EventType::CommandReceived, "agent:alice")));
        assert!(!filter.matches(&event(2, EventType::CommandBlocked, "agent:alice")));
        assert!(!filter.matches(&event(2, EventType::CommandReceived, "agent:bob")));
        assert!(!filter.matches(&event(1, EventType::CommandReceived, "agent:alice")));
    }

    #[test]
    fn timestamp_bounds_are_inclusive() {
        let filter = EventFilter {
            after_timestamp_ns: Some(10),
            before_timestamp_ns: Some(20),
            ..Default::default()
        };
        assert!(filter.matches(&event(1, EventType::CommandReceived, "a")));
        assert!(!filter.matches(&event(3, EventType::CommandReceived, "a")));
    }

    #[test]
    fn sort_descending_by_sequence() {
        let query = EventQuery {
            ascending: false,
            ..Default::default()
        };
        let mut events = vec![
            event(1, EventType::CommandReceived, "a"),
            event(3, EventType::CommandReceived, "a"),
            event(2, EventType::CommandReceived, "a"),
        ];
        query.sort(&mut events);
        let sequences: Vec<u64> = events.iter().filter_map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 2, 1]);
    }

    #[test]
    fn limit_is_capped() {
        let query = EventQuery::with_limit(1_000_000);
        assert_eq!(query.effective_limit(), MAX_QUERY_LIMIT);
    }
}
