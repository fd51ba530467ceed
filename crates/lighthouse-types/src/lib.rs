#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-types** – Shared primitive data structures for Lighthouse.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines agent identity, validation requests and results, and the size
//! caps enforced at every trust boundary. It intentionally makes no
//! assumptions about I/O, storage, or async runtimes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

//─────────────────────────────
//  Security constants
//─────────────────────────────

/// Maximum serialized size of a single event (1 MiB).
pub const MAX_EVENT_SIZE_BYTES: usize = 1_048_576;

/// Maximum number of events accepted in one batch append.
pub const MAX_BATCH_EVENTS: usize = 1000;

/// Maximum total serialized size of a batch (10 MiB).
pub const MAX_BATCH_SIZE_BYTES: usize = 10 * 1_048_576;

/// Maximum nesting depth allowed in event payloads.
pub const MAX_PAYLOAD_DEPTH: usize = 10;

/// Maximum length of any single string field in a payload.
pub const MAX_STRING_LEN: usize = 1_048_576;

/// Maximum number of entries in event metadata maps.
pub const MAX_METADATA_ENTRIES: usize = 64;

//─────────────────────────────
//  Agent identity
//─────────────────────────────

/// Opaque identifier for an agent principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create an agent id, rejecting empty or oversized names.
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("agent id cannot be empty".to_string());
        }
        if id.len() > 256 {
            return Err(format!("agent id too long: {} > 256", id.len()));
        }
        if id.contains(':') || id.contains('\0') {
            return Err("agent id contains reserved characters".to_string());
        }
        Ok(Self(id))
    }

    /// Borrow the raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Role assigned to an agent principal.
///
/// Roles gate event-store writes, batch sizes, and rate limits. The mapping
/// follows the platform's permission table and is deliberately closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Read-only observer.
    Guest,
    /// Regular coding agent.
    Agent,
    /// Registered specialist that accepts escalations.
    Expert,
    /// Internal system principal.
    System,
    /// Operator with unrestricted access.
    Admin,
}

/// Fine-grained permission drawn from a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Query the event store.
    ReadEvents,
    /// Append to the event store.
    WriteEvents,
    /// Administrative operations (snapshots, truncation boundaries).
    Admin,
    /// Create elicitations addressed to other agents.
    Elicit,
    /// Respond to elicitations addressed to this agent.
    Respond,
    /// Accept escalated validation requests.
    ActAsExpert,
}

impl AgentRole {
    /// Permission set granted to this role.
    pub fn default_permissions(&self) -> Vec<Permission> {
        use Permission::*;
        match self {
            AgentRole::Guest => vec![ReadEvents],
            AgentRole::Agent => vec![ReadEvents, WriteEvents, Elicit, Respond],
            AgentRole::Expert => {
                vec![ReadEvents, WriteEvents, Elicit, Respond, ActAsExpert]
            }
            AgentRole::System => vec![ReadEvents, WriteEvents, Elicit, Respond, Admin],
            AgentRole::Admin => {
                vec![ReadEvents, WriteEvents, Elicit, Respond, ActAsExpert, Admin]
            }
        }
    }

    /// Sustained request budget per minute, `None` meaning unbounded.
    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        match self {
            AgentRole::Guest => Some(100),
            AgentRole::Agent => Some(1000),
            AgentRole::Expert => Some(5000),
            AgentRole::System => Some(5000),
            AgentRole::Admin => None,
        }
    }

    /// Maximum events per batch append for this role.
    pub fn max_batch_size(&self) -> usize {
        match self {
            AgentRole::Guest => 0,
            AgentRole::Agent => 100,
            AgentRole::Expert => 1000,
            AgentRole::System => 1000,
            AgentRole::Admin => MAX_BATCH_EVENTS,
        }
    }
}

/// Fully-resolved identity of an authenticated agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// The agent principal.
    pub agent_id: AgentId,
    /// Assigned role.
    pub role: AgentRole,
    /// Effective permissions (normally `role.default_permissions()`).
    pub permissions: Vec<Permission>,
    /// Maximum events per batch append.
    pub max_batch_size: usize,
    /// Sustained request budget per minute, `None` meaning unbounded.
    pub rate_limit_per_minute: Option<u32>,
    /// Token expiry in nanoseconds since the Unix epoch.
    pub token_expires_at: u64,
}

impl AgentIdentity {
    /// Build an identity from a role with its default grants.
    pub fn for_role(agent_id: AgentId, role: AgentRole, token_expires_at: u64) -> Self {
        Self {
            agent_id,
            permissions: role.default_permissions(),
            max_batch_size: role.max_batch_size(),
            rate_limit_per_minute: role.rate_limit_per_minute(),
            role,
            token_expires_at,
        }
    }

    /// Whether this identity holds `permission`.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

//─────────────────────────────
//  Validation decisions
//─────────────────────────────

/// Final ruling on a proposed tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Safe to execute.
    Approved,
    /// Must not execute.
    Blocked,
    /// Needs deliberation by an expert agent.
    Escalate,
}

/// Confidence attached to a decision by the tier that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Weak signal, never trusted on its own.
    Low,
    /// Heuristic match.
    Medium,
    /// Authoritative rule or expert ruling.
    High,
}

/// Cache tier that served a hit, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheLayer {
    /// Result was computed, not served from cache.
    #[default]
    None,
    /// Served from the in-process LRU tier.
    Local,
    /// Served from the remote KV tier.
    Remote,
}

/// Assessed severity of the proposed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// No meaningful risk identified.
    #[default]
    Low,
    /// Some risk, mitigations expected.
    Medium,
    /// Significant risk.
    High,
    /// Destructive or privilege-escalating.
    Critical,
}

//─────────────────────────────
//  Validation request / result
//─────────────────────────────

/// A proposed tool invocation awaiting a ruling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Unique id for this request.
    pub request_id: String,
    /// Tool being invoked, e.g. `Bash`, `Read`, `Write`.
    pub tool_name: String,
    /// Structured tool arguments.
    pub tool_input: Value,
    /// Proposing agent.
    pub agent_id: AgentId,
    /// Session under which the agent is operating.
    pub session_id: String,
}

impl ValidationRequest {
    /// Create a request with a fresh id.
    pub fn new(
        tool_name: impl Into<String>,
        tool_input: Value,
        agent_id: AgentId,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            tool_input,
            agent_id,
            session_id: session_id.into(),
        }
    }

    /// Stable cache key over tool, canonicalised input, and the agent *role*.
    ///
    /// The agent id is deliberately excluded so identical safe commands from
    /// different agents share cache entries.
    pub fn fingerprint(&self, role: AgentRole) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tool_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(&self.tool_input).as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{role:?}").as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Outcome of running a request through the validation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// The ruling.
    pub decision: Decision,
    /// Confidence of the tier that produced the ruling.
    pub confidence: Confidence,
    /// Human-readable reason.
    pub reason: String,
    /// Request this result answers.
    pub request_id: String,
    /// Wall-clock pipeline time in milliseconds.
    pub processing_time_ms: f64,
    /// Whether the result was served from cache.
    pub cache_hit: bool,
    /// Tier that served the hit.
    pub cache_layer: CacheLayer,
    /// Whether an expert was (or must be) consulted.
    pub expert_required: bool,
    /// Assessed severity.
    pub risk_level: RiskLevel,
    /// Specific concerns raised by tiers or experts.
    pub security_concerns: Vec<String>,
}

impl ValidationResult {
    /// Construct a result with the given ruling and defaults elsewhere.
    pub fn new(
        request_id: impl Into<String>,
        decision: Decision,
        confidence: Confidence,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            decision,
            confidence,
            reason: reason.into(),
            request_id: request_id.into(),
            processing_time_ms: 0.0,
            cache_hit: false,
            cache_layer: CacheLayer::None,
            expert_required: false,
            risk_level: RiskLevel::default(),
            security_concerns: Vec::new(),
        }
    }
}

//─────────────────────────────
//  Canonical JSON
//─────────────────────────────

/// Render a JSON value with object keys sorted, for stable hashing.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalise(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalise(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalise).collect()),
            other => other.clone(),
        }
    }
    canonicalise(value).to_string()
}

/// Measure the nesting depth of a JSON value.
pub fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}
