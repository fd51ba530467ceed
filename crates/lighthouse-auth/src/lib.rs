#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-auth** – Session and authorisation primitives for Lighthouse.
//!
//! Sessions are bound to an agent with a four-part HMAC token
//! (`<session_id>:<agent_id>:<issued_at_ns>:<signature>`); presenting a valid
//! token under a different agent id is always rejected. The session table is
//! per-process, so a restart invalidates every outstanding token. Rate limits
//! are token buckets per agent with bounded memory and deterministic
//! eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use lighthouse_types::{AgentId, AgentIdentity, Permission};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted length for the token-signing secret.
pub const MIN_SECRET_LEN: usize = 32;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Authentication failures: the caller's identity could not be established.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Token was structurally invalid or its signature did not verify.
    #[error("invalid session token")]
    InvalidToken,
    /// Token was valid once but the session has timed out.
    #[error("session expired")]
    SessionExpired,
    /// Token verified but no live session backs it (restart or revocation).
    #[error("session not found")]
    SessionNotFound,
    /// Token presented under a different agent id than it was issued to.
    #[error("session token is bound to a different agent")]
    AgentMismatch,
    /// No identity registered for the agent.
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    /// The per-process session table is full.
    #[error("too many concurrent sessions")]
    TooManySessions,
}

/// Authorisation failures: the identity is known but the call is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    /// Role does not hold the required permission.
    #[error("agent {agent} lacks permission {permission:?}")]
    PermissionDenied {
        /// The denied agent.
        agent: String,
        /// The missing permission.
        permission: Permission,
    },
    /// The agent's token bucket is exhausted.
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded {
        /// Suggested wait before retrying.
        retry_after_ms: u64,
    },
    /// The batch exceeds the role's cap.
    #[error("batch of {size} exceeds cap {cap}")]
    BatchTooLarge {
        /// Offered batch size.
        size: usize,
        /// Role's cap.
        cap: usize,
    },
}

//─────────────────────────────
//  Agent directory
//─────────────────────────────

/// In-memory registry of known agent identities.
#[derive(Debug, Default)]
pub struct AgentDirectory {
    identities: DashMap<AgentId, AgentIdentity>,
}

impl AgentDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an identity.
    pub fn register(&self, identity: AgentIdentity) {
        self.identities.insert(identity.agent_id.clone(), identity);
    }

    /// Look up an identity.
    pub fn resolve(&self, agent: &AgentId) -> Option<AgentIdentity> {
        self.identities.get(agent).map(|i| i.clone())
    }

    /// Look up an identity, failing for unknown agents.
    pub fn require(&self, agent: &AgentId) -> Result<AgentIdentity, AuthError> {
        self.resolve(agent)
            .ok_or_else(|| AuthError::UnknownAgent(agent.to_string()))
    }

    /// Resolve and check a permission, logging the outcome.
    pub fn authorize(
        &self,
        agent: &AgentId,
        permission: Permission,
    ) -> Result<AgentIdentity, AuthzResolution> {
        let identity = self
            .require(agent)
            .map_err(AuthzResolution::Unauthenticated)?;
        if identity.has_permission(permission) {
            debug!(agent = %agent, ?permission, "authorisation granted");
            Ok(identity)
        } else {
            warn!(agent = %agent, ?permission, "authorisation denied");
            Err(AuthzResolution::Denied(AuthzError::PermissionDenied {
                agent: agent.to_string(),
                permission,
            }))
        }
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Outcome of an authorisation check that may fail either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzResolution {
    /// Agent is not known at all.
    Unauthenticated(AuthError),
    /// Agent is known but lacks the permission.
    Denied(AuthzError),
}

//─────────────────────────────
//  Sessions
//─────────────────────────────

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Recently active.
    Active,
    /// Live but quiet.
    Idle,
    /// Timed out.
    Expired,
    /// Administratively terminated.
    Revoked,
}

/// A live authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub session_id: String,
    /// Agent the session is bound to.
    pub agent_id: AgentId,
    /// Four-part HMAC token handed to the client.
    pub session_token: String,
    /// Issue time, nanoseconds since the Unix epoch.
    pub created_at_ns: u64,
    /// Last validated use.
    pub last_activity_ns: u64,
    /// Client address as reported by the transport.
    pub ip_address: String,
    /// Client software identifier.
    pub user_agent: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Commands validated under this session.
    pub command_count: u64,
}

/// Issues and validates HMAC-bound session tokens.
///
/// The table lives in process memory only; restarting the process
/// invalidates every session and clients must re-authenticate.
pub struct SessionManager {
    secret: Vec<u8>,
    session_timeout: Duration,
    max_concurrent: usize,
    sessions: DashMap<String, Session>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager; the secret must be at least [`MIN_SECRET_LEN`] bytes.
    pub fn new(
        secret: &[u8],
        session_timeout: Duration,
        max_concurrent: usize,
    ) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::InvalidToken);
        }
        Ok(Self {
            secret: secret.to_vec(),
            session_timeout,
            max_concurrent,
            sessions: DashMap::new(),
        })
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length")
    }

    fn sign_parts(&self, session_id: &str, agent_id: &str, issued_at_ns: u64) -> String {
        let mut mac = self.mac();
        mac.update(format!("{session_id}:{agent_id}:{issued_at_ns}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a session for `agent_id`.
    pub fn create_session(
        &self,
        agent_id: &AgentId,
        ip_address: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Result<Session, AuthError> {
        self.expire_stale();
        if self.sessions.len() >= self.max_concurrent {
            return Err(AuthError::TooManySessions);
        }

        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let issued_at_ns = now_ns();
        let signature = self.sign_parts(&session_id, agent_id.as_str(), issued_at_ns);
        let session_token = format!("{session_id}:{agent_id}:{issued_at_ns}:{signature}");

        let session = Session {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            session_token,
            created_at_ns: issued_at_ns,
            last_activity_ns: issued_at_ns,
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            state: SessionState::Active,
            command_count: 0,
        };
        self.sessions.insert(session_id, session.clone());
        debug!(agent = %agent_id, session = %session.session_id, "session created");
        Ok(session)
    }

    /// Validate `token` presented by `claimed_agent`, updating activity.
    ///
    /// A structurally valid token with a verifying signature is still
    /// rejected when the embedded agent differs from the caller's claimed
    /// identity, or when no live session backs it.
    pub fn validate_session(
        &self,
        token: &str,
        claimed_agent: &AgentId,
    ) -> Result<Session, AuthError> {
        let mut parts = token.split(':');
        let (Some(session_id), Some(agent_id), Some(issued_at), Some(signature), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(AuthError::InvalidToken);
        };
        let issued_at_ns: u64 = issued_at.parse().map_err(|_| AuthError::InvalidToken)?;

        let mut mac = self.mac();
        mac.update(format!("{session_id}:{agent_id}:{issued_at_ns}").as_bytes());
        let verified = hex::decode(signature)
            .ok()
            .map(|sig| mac.verify_slice(&sig).is_ok())
            .unwrap_or(false);
        if !verified {
            warn!(agent = %claimed_agent, "session token failed signature check");
            return Err(AuthError::InvalidToken);
        }

        if agent_id != claimed_agent.as_str() {
            warn!(
                token_agent = agent_id,
                claimed = %claimed_agent,
                "session token presented under a different agent id"
            );
            return Err(AuthError::AgentMismatch);
        }

        let now = now_ns();
        if now >= issued_at_ns.saturating_add(self.session_timeout.as_nanos() as u64) {
            if let Some(mut session) = self.sessions.get_mut(session_id) {
                session.state = SessionState::Expired;
            }
            return Err(AuthError::SessionExpired);
        }

        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or(AuthError::SessionNotFound)?;
        if matches!(session.state, SessionState::Expired | SessionState::Revoked) {
            return Err(AuthError::SessionNotFound);
        }
        session.state = SessionState::Active;
        session.last_activity_ns = now;
        session.command_count += 1;
        Ok(session.clone())
    }

    /// Revoke a session by id; the token stops validating immediately.
    pub fn revoke_session(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.state = SessionState::Revoked;
                true
            }
            None => false,
        }
    }

    /// Count of live (non-terminal) sessions.
    pub fn active_session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| matches!(s.state, SessionState::Active | SessionState::Idle))
            .count()
    }

    /// Mark timed-out sessions expired, quiet ones idle, and drop terminal
    /// ones.
    pub fn expire_stale(&self) {
        let now = now_ns();
        let timeout_ns = self.session_timeout.as_nanos() as u64;
        self.sessions.retain(|_, session| {
            if now >= session.created_at_ns.saturating_add(timeout_ns) {
                session.state = SessionState::Expired;
            } else if session.state == SessionState::Active
                && now.saturating_sub(session.last_activity_ns) > timeout_ns / 2
            {
                session.state = SessionState::Idle;
            }
            !matches!(session.state, SessionState::Expired | SessionState::Revoked)
        });
    }
}

//─────────────────────────────
//  Rate limiting
//─────────────────────────────

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill_ns: u64,
    last_used_ns: u64,
}

/// Token-bucket rate limiter keyed by agent, with bounded memory.
///
/// Buckets refill continuously at the identity's per-minute rate and hold at
/// most one minute of burst. When the table exceeds its bound the
/// longest-idle bucket is evicted first, ties broken by agent id so eviction
/// is deterministic.
#[derive(Debug)]
pub struct RateLimiter {
    max_entries: usize,
    buckets: Mutex<HashMap<AgentId, Bucket>>,
}

impl RateLimiter {
    /// Create a limiter retaining at most `max_entries` agent buckets.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Charge `cost` operations against `identity`'s budget.
    pub fn check(&self, identity: &AgentIdentity, cost: u32) -> Result<(), AuthzError> {
        let Some(per_minute) = identity.rate_limit_per_minute else {
            return Ok(());
        };
        let per_minute = f64::from(per_minute);
        let now = now_ns();

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(identity.agent_id.clone())
            .or_insert_with(|| Bucket {
                tokens: per_minute,
                last_refill_ns: now,
                last_used_ns: now,
            });

        let elapsed_s = (now.saturating_sub(bucket.last_refill_ns)) as f64 / 1e9;
        bucket.tokens = (bucket.tokens + elapsed_s * per_minute / 60.0).min(per_minute);
        bucket.last_refill_ns = now;
        bucket.last_used_ns = now;

        let cost = f64::from(cost);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            drop(buckets);
            self.evict_if_needed();
            Ok(())
        } else {
            let deficit = cost - bucket.tokens;
            let retry_after_ms = (deficit * 60_000.0 / per_minute).ceil() as u64;
            Err(AuthzError::RateLimitExceeded { retry_after_ms })
        }
    }

    fn evict_if_needed(&self) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        while buckets.len() > self.max_entries {
            let victim = buckets
                .iter()
                .min_by_key(|(agent, bucket)| (bucket.last_used_ns, (*agent).clone()))
                .map(|(agent, _)| agent.clone());
            match victim {
                Some(agent) => {
                    buckets.remove(&agent);
                }
                None => break,
            }
        }
    }

    /// Number of retained buckets.
    pub fn tracked_agents(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
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
    use lighthouse_types::AgentRole;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn agent(name: &str) -> AgentId {
        AgentId::new(name).unwrap()
    }

    fn manager() -> SessionManager {
        SessionManager::new(SECRET, Duration::from_secs(3600), 100).unwrap()
    }

    fn identity(name: &str, role: AgentRole) -> AgentIdentity {
        AgentIdentity::for_role(agent(name), role, u64::MAX)
    }

    #[test]
    fn rejects_short_secret() {
        assert!(SessionManager::new(b"short", Duration::from_secs(60), 10).is_err());
    }

    #[test]
    fn token_has_four_parts_and_validates() {
        let manager = manager();
        let session = manager.create_session(&agent("alice"), "127.0.0.1", "test/1.0").unwrap();
        assert_eq!(session.session_token.split(':').count(), 4);

        let validated = manager
            .validate_session(&session.session_token, &agent("alice"))
            .unwrap();
        assert_eq!(validated.session_id, session.session_id);
        assert_eq!(validated.command_count, 1);
    }

    #[test]
    fn token_is_bound_to_its_agent() {
        let manager = manager();
        let session = manager.create_session(&agent("alice"), "127.0.0.1", "test/1.0").unwrap();
        let err = manager
            .validate_session(&session.session_token, &agent("mallory"))
            .unwrap_err();
        assert_eq!(err, AuthError::AgentMismatch);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let manager = manager();
        let session = manager.create_session(&agent("alice"), "127.0.0.1", "test/1.0").unwrap();

        // Swap the embedded agent while keeping the original signature.
        let mut parts: Vec<&str> = session.session_token.split(':').collect();
        parts[1] = "mallory";
        let forged = parts.join(":");
        let err = manager
            .validate_session(&forged, &agent("mallory"))
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[test]
    fn restart_invalidates_sessions() {
        let first = manager();
        let session = first.create_session(&agent("alice"), "127.0.0.1", "test/1.0").unwrap();

        // A fresh manager with the same secret verifies the signature but has
        // no backing session entry.
        let second = manager();
        let err = second
            .validate_session(&session.session_token, &agent("alice"))
            .unwrap_err();
        assert_eq!(err, AuthError::SessionNotFound);
    }

    #[test]
    fn expired_sessions_stop_validating() {
        let manager = SessionManager::new(SECRET, Duration::from_nanos(1), 10).unwrap();
        let session = manager.create_session(&agent("alice"), "127.0.0.1", "test/1.0").unwrap();
        let err = manager
            .validate_session(&session.session_token, &agent("alice"))
            .unwrap_err();
        assert_eq!(err, AuthError::SessionExpired);
    }

    #[test]
    fn revoked_sessions_stop_validating() {
        let manager = manager();
        let session = manager.create_session(&agent("alice"), "127.0.0.1", "test/1.0").unwrap();
        assert!(manager.revoke_session(&session.session_id));
        let err = manager
            .validate_session(&session.session_token, &agent("alice"))
            .unwrap_err();
        assert_eq!(err, AuthError::SessionNotFound);
    }

    #[test]
    fn concurrent_session_cap_is_enforced() {
        let manager = SessionManager::new(SECRET, Duration::from_secs(3600), 2).unwrap();
        manager.create_session(&agent("a"), "ip", "ua").unwrap();
        manager.create_session(&agent("b"), "ip", "ua").unwrap();
        let err = manager.create_session(&agent("c"), "ip", "ua").unwrap_err();
        assert_eq!(err, AuthError::TooManySessions);
    }

    #[test]
    fn directory_authorizes_by_permission() {
        let directory = AgentDirectory::new();
        directory.register(identity("alice", AgentRole::Agent));
        directory.register(identity("guest", AgentRole::Guest));

        assert!(directory
            .authorize(&agent("alice"), Permission::WriteEvents)
            .is_ok());
        assert!(matches!(
            directory.authorize(&agent("guest"), Permission::WriteEvents),
            Err(AuthzResolution::Denied(AuthzError::PermissionDenied { .. }))
        ));
        assert!(matches!(
            directory.authorize(&agent("nobody"), Permission::ReadEvents),
            Err(AuthzResolution::Unauthenticated(AuthError::UnknownAgent(_)))
        ));
    }

    #[test]
    fn rate_limiter_exhausts_and_reports_retry() {
        let limiter = RateLimiter::new(100);
        let alice = identity("alice", AgentRole::Agent); // 1000/min

        assert!(limiter.check(&alice, 1000).is_ok());
        match limiter.check(&alice, 1) {
            Err(AuthzError::RateLimitExceeded { retry_after_ms }) => {
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn admin_is_unlimited() {
        let limiter = RateLimiter::new(100);
        let admin = identity("root", AgentRole::Admin);
        for _ in 0..10 {
            assert!(limiter.check(&admin, 1_000_000).is_ok());
        }
        // Unlimited identities never allocate a bucket.
        assert_eq!(limiter.tracked_agents(), 0);
    }

    #[test]
    fn eviction_is_bounded_and_deterministic() {
        let limiter = RateLimiter::new(2);
        for name in ["a", "b", "c", "d"] {
            let id = identity(name, AgentRole::Agent);
            limiter.check(&id, 1).unwrap();
        }
        assert!(limiter.tracked_agents() <= 2);
    }
}
