#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-bridge** – Composition facade for the Lighthouse core.
//!
//! The bridge owns the lifetimes of every component: storage driver, event
//! store, session manager, caches, speed layer, expert coordinator, and
//! elicitation manager are built by explicit construction rather than shared
//! singletons, and every transport call threads the authenticated agent
//! identity through session validation before touching a component. Results
//! are plain serde types so any transport can render them; errors map onto
//! transport status codes via [`BridgeError::status_code`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lighthouse_auth::{
    AgentDirectory, AuthError, AuthzError, AuthzResolution, RateLimiter, Session, SessionManager,
};
use lighthouse_cache::{LocalCacheConfig, RemoteCache, TieredCache};
use lighthouse_elicitation::{
    ElicitationError, ElicitationManager, ElicitationOutcome, ResponseType,
};
use lighthouse_event_core::{
    EventQuery, EventSigner, EventType, FsyncPolicy, QueryResult,
};
use lighthouse_event_store::{EventStore, EventStoreHealth, StoreError};
use lighthouse_expert::{
    CoordinatorEscalator, ExpertCoordinator, ExpertInbox, ExpertRegistration,
};
use lighthouse_speed_layer::{
    ExpertEscalator, MlTier, SpeedLayerConfig, SpeedLayerDispatcher, SpeedLayerError,
    SpeedLayerMetrics,
};
use lighthouse_store_segmented::SegmentedLogBackend;
use lighthouse_store_sqlite::SqliteBackend;
use lighthouse_types::{
    AgentId, AgentIdentity, AgentRole, Decision, Permission, ValidationRequest, ValidationResult,
};

mod config;

pub use config::{BridgeConfig, StorageBackendKind};

/// Heartbeats may be this many expert timeouts apart before an expert is
/// considered offline.
const HEARTBEAT_WINDOW_FACTOR: u32 = 3;

/// Bound on each expert's pending assignment queue.
const EXPERT_QUEUE_CAPACITY: usize = 64;

/// How long terminal elicitations are retained for audit.
const ELICITATION_RETENTION: Duration = Duration::from_secs(24 * 3600);

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Error surface exposed to transports.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Unrecoverable startup failure (bad configuration).
    #[error("configuration error: {0}")]
    Config(String),
    /// Caller identity could not be established.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Caller is known but the operation is not allowed.
    #[error(transparent)]
    Authorization(#[from] AuthzError),
    /// Malformed input.
    #[error("validation error: {0}")]
    Validation(String),
    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The operation conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,
    /// A component is unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Internal failure; details are logged, not surfaced.
    #[error("internal error")]
    Internal,
}

impl BridgeError {
    /// HTTP-shaped status code for transports.
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::Config(_) => 500,
            BridgeError::Auth(_) => 401,
            BridgeError::Authorization(AuthzError::RateLimitExceeded { .. }) => 429,
            BridgeError::Authorization(_) => 403,
            BridgeError::Validation(_) => 422,
            BridgeError::NotFound(_) => 404,
            BridgeError::Conflict(_) => 409,
            BridgeError::Cancelled => 499,
            BridgeError::Unavailable(_) => 503,
            BridgeError::Internal => 500,
        }
    }

    /// Process exit code for unrecoverable startup failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(_) => 2,
            BridgeError::Unavailable(_) => 3,
            _ => 1,
        }
    }
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Auth(e) => BridgeError::Auth(e),
            StoreError::Authorization(e) => BridgeError::Authorization(e),
            StoreError::Validation(reason) => BridgeError::Validation(reason),
            StoreError::PayloadTooLarge { size, limit } => {
                BridgeError::Validation(format!("payload of {size} bytes exceeds {limit}"))
            }
            StoreError::Degraded | StoreError::StorageFull => {
                BridgeError::Unavailable(e.to_string())
            }
            StoreError::Storage(_) => {
                warn!(error = %e, "storage failure surfaced to transport");
                BridgeError::Internal
            }
        }
    }
}

impl From<AuthzResolution> for BridgeError {
    fn from(r: AuthzResolution) -> Self {
        match r {
            AuthzResolution::Unauthenticated(e) => BridgeError::Auth(e),
            AuthzResolution::Denied(e) => BridgeError::Authorization(e),
        }
    }
}

impl From<ElicitationError> for BridgeError {
    fn from(e: ElicitationError) -> Self {
        match e {
            ElicitationError::NotFound => BridgeError::NotFound("elicitation".to_string()),
            ElicitationError::AlreadyResolved | ElicitationError::AlreadyAwaited => {
                BridgeError::Conflict(e.to_string())
            }
            ElicitationError::SchemaViolation(_) | ElicitationError::InvalidSchema(_) => {
                BridgeError::Validation(e.to_string())
            }
            ElicitationError::Expired => BridgeError::Conflict(e.to_string()),
            ElicitationError::Cancelled => BridgeError::Cancelled,
            ElicitationError::NotAddressee => {
                BridgeError::Authorization(AuthzError::PermissionDenied {
                    agent: "responder".to_string(),
                    permission: Permission::Respond,
                })
            }
            ElicitationError::Store(reason) => {
                warn!(reason = %reason, "elicitation event append failed");
                BridgeError::Internal
            }
        }
    }
}

//─────────────────────────────
//  Health report
//─────────────────────────────

/// Structured health output for the transport's health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `"healthy"` or `"degraded"`.
    pub status: String,
    /// When the report was produced.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Seconds since the bridge started.
    pub uptime_seconds: f64,
    /// Event store health details.
    pub event_store: EventStoreHealth,
    /// Live sessions.
    pub active_sessions: usize,
    /// Expert counts keyed by status name.
    pub experts: HashMap<String, usize>,
    /// Cache hit rate across both tiers.
    pub cache_hit_rate: f64,
    /// Hits served by the local tier.
    pub cache_local_hits: u64,
    /// Hits served by the remote tier.
    pub cache_remote_hits: u64,
    /// Currently pinned hot entries.
    pub cache_hot_entries: u64,
    /// Pipeline counters.
    pub pipeline: PipelineHealth,
    /// Elicitations still awaiting response.
    pub pending_elicitations: usize,
}

/// Speed-layer counters in the health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineHealth {
    /// Requests settled by the cache.
    pub cache_hits: u64,
    /// Requests settled by the policy tier.
    pub policy_hits: u64,
    /// Requests settled by the pattern tier.
    pub pattern_hits: u64,
    /// Requests escalated to experts.
    pub escalations: u64,
    /// Requests blocked because no tier could answer.
    pub fail_closed: u64,
}

impl From<SpeedLayerMetrics> for PipelineHealth {
    fn from(m: SpeedLayerMetrics) -> Self {
        Self {
            cache_hits: m.cache_hits,
            policy_hits: m.policy_hits,
            pattern_hits: m.pattern_hits,
            escalations: m.escalations,
            fail_closed: m.fail_closed,
        }
    }
}

//─────────────────────────────
//  Bridge
//─────────────────────────────

/// The composed Lighthouse core.
pub struct Bridge {
    config: BridgeConfig,
    directory: Arc<AgentDirectory>,
    sessions: SessionManager,
    store: Arc<EventStore>,
    dispatcher: Arc<SpeedLayerDispatcher>,
    coordinator: Arc<ExpertCoordinator>,
    elicitations: Arc<ElicitationManager>,
    system_agent: AgentId,
    started_at: Instant,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("node_id", &self.config.node_id)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Build and start the core from `config`.
    ///
    /// `remote_cache` and `ml_tier` are constructed by the embedding shell
    /// (the core does not dial networks itself); pass `None` to run without
    /// them.
    pub async fn new(
        config: BridgeConfig,
        remote_cache: Option<Arc<dyn RemoteCache>>,
        ml_tier: Option<Arc<dyn MlTier>>,
    ) -> Result<Self, BridgeError> {
        config.validate().map_err(BridgeError::Config)?;
        let signer = EventSigner::new(&config.auth_secret)
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        let directory = Arc::new(AgentDirectory::new());
        let system_agent =
            AgentId::new("lighthouse").map_err(BridgeError::Config)?;
        directory.register(AgentIdentity::for_role(
            system_agent.clone(),
            AgentRole::System,
            u64::MAX,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(config.max_concurrent_sessions * 4));
        let sessions = SessionManager::new(
            &config.auth_secret,
            config.session_timeout(),
            config.max_concurrent_sessions,
        )
        .map_err(|_| BridgeError::Config("auth_secret rejected".to_string()))?;

        let backend: Arc<dyn lighthouse_event_core::EventBackend> = match config.storage_backend {
            StorageBackendKind::SegmentedLog => Arc::new(
                SegmentedLogBackend::open(config.data_dir.join("events"), config.fsync_policy)
                    .map_err(|e| BridgeError::Unavailable(e.to_string()))?,
            ),
            StorageBackendKind::SqliteWal => Arc::new(
                SqliteBackend::open(config.data_dir.join("events.db"), config.fsync_policy)
                    .await
                    .map_err(|e| BridgeError::Unavailable(e.to_string()))?,
            ),
        };

        let store = Arc::new(
            EventStore::open(
                backend,
                signer.clone(),
                config.node_id.clone(),
                Arc::clone(&directory),
                rate_limiter,
                config.data_dir.join("snapshots"),
            )
            .await
            .map_err(BridgeError::from)?,
        );

        if let FsyncPolicy::Interval(ms) = config.fsync_policy {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(ms.max(1)));
                loop {
                    ticker.tick().await;
                    if let Err(e) = store.sync().await {
                        warn!(error = %e, "interval fsync failed");
                    }
                }
            });
        }

        let cache = Arc::new(TieredCache::new(
            LocalCacheConfig {
                max_entries: config.local_cache_max_entries,
                max_bytes: config.local_cache_max_bytes,
                hot_entry_threshold: config.hot_entry_threshold,
                ..LocalCacheConfig::default()
            },
            remote_cache,
            Duration::from_secs(config.remote_cache_ttl_s),
            config.remote_cache_op_timeout(),
        ));

        let coordinator = Arc::new(ExpertCoordinator::new(
            config.expert_timeout() * HEARTBEAT_WINDOW_FACTOR,
            EXPERT_QUEUE_CAPACITY,
        ));
        let escalator: Arc<dyn ExpertEscalator> = Arc::new(CoordinatorEscalator::new(
            Arc::clone(&coordinator),
            config.expert_timeout(),
            config.expert_consensus_default,
        ));

        let dispatcher = Arc::new(SpeedLayerDispatcher::new(
            cache,
            ml_tier,
            Some(escalator),
            SpeedLayerConfig {
                ml_confidence_floor: config.ml_confidence_floor,
                ..SpeedLayerConfig::default()
            },
        ));

        let elicitations = ElicitationManager::new(
            Arc::clone(&store),
            signer,
            system_agent.clone(),
            ELICITATION_RETENTION,
        );

        let bridge = Self {
            config,
            directory,
            sessions,
            store,
            dispatcher,
            coordinator,
            elicitations,
            system_agent,
            started_at: Instant::now(),
        };
        bridge.record_system_event(EventType::SystemStarted).await;
        info!(node = %bridge.config.node_id, "bridge started");
        Ok(bridge)
    }

    async fn record_system_event(&self, event_type: EventType) {
        let event = self.store.new_event(
            event_type,
            "system:bridge",
            json!({"node_id": self.config.node_id}),
            self.system_agent.clone(),
        );
        if let Err(e) = self.store.append(event, &self.system_agent).await {
            warn!(error = %e, "failed to record system event");
        }
    }

    /// Record the shutdown event; call before dropping the bridge.
    pub async fn shutdown(&self) {
        self.record_system_event(EventType::SystemStopped).await;
        info!(node = %self.config.node_id, "bridge stopped");
    }

    /// Register an agent principal with a role.
    ///
    /// Called by the embedding shell when an agent joins; appends an
    /// `agent_registered` event.
    pub async fn register_agent(
        &self,
        agent_id: &AgentId,
        role: AgentRole,
    ) -> Result<(), BridgeError> {
        let expires = u64::MAX;
        self.directory
            .register(AgentIdentity::for_role(agent_id.clone(), role, expires));
        let event = self.store.new_event(
            EventType::AgentRegistered,
            format!("agent:{agent_id}"),
            json!({"agent_id": agent_id, "role": role}),
            self.system_agent.clone(),
        );
        self.store.append(event, &self.system_agent).await?;
        Ok(())
    }

    /// Issue a session for a registered agent.
    pub async fn create_session(
        &self,
        agent_id: &AgentId,
        ip_address: &str,
        user_agent: &str,
    ) -> Result<Session, BridgeError> {
        self.directory.require(agent_id)?;
        let session = self
            .sessions
            .create_session(agent_id, ip_address, user_agent)?;
        let event = self.store.new_event(
            EventType::SessionStarted,
            format!("agent:{agent_id}"),
            json!({"session_id": session.session_id, "ip_address": ip_address}),
            agent_id.clone(),
        );
        self.store.append(event, agent_id).await?;
        Ok(session)
    }

    fn authenticate(
        &self,
        session_token: &str,
        agent_id: &AgentId,
    ) -> Result<AgentIdentity, BridgeError> {
        self.sessions.validate_session(session_token, agent_id)?;
        Ok(self.directory.require(agent_id)?)
    }

    /// Validate a proposed tool invocation.
    ///
    /// Appends `command_received` before dispatch and `command_validated` or
    /// `command_blocked` after, so the log records every ruling.
    pub async fn validate_command(
        &self,
        session_token: &str,
        request: ValidationRequest,
        cancel: CancellationToken,
    ) -> Result<ValidationResult, BridgeError> {
        let identity = self.authenticate(session_token, &request.agent_id)?;

        let received = self.store.new_event(
            EventType::CommandReceived,
            format!("agent:{}", request.agent_id),
            json!({
                "request_id": request.request_id,
                "tool": request.tool_name,
                "input": request.tool_input,
            }),
            request.agent_id.clone(),
        );
        self.store.append(received, &request.agent_id).await?;

        let result = self
            .dispatcher
            .validate(&request, identity.role, cancel)
            .await
            .map_err(|_: SpeedLayerError| BridgeError::Cancelled)?;

        let (event_type, aggregate) = match result.decision {
            Decision::Blocked => (
                EventType::CommandBlocked,
                format!("agent:{}", request.agent_id),
            ),
            _ => (
                EventType::CommandValidated,
                format!("agent:{}", request.agent_id),
            ),
        };
        let ruled = self.store.new_event(
            event_type,
            aggregate,
            json!({
                "request_id": request.request_id,
                "decision": result.decision,
                "confidence": result.confidence,
                "reason": result.reason,
                "risk_level": result.risk_level,
                "cache_hit": result.cache_hit,
            }),
            request.agent_id.clone(),
        );
        if let Err(e) = self.store.append(ruled, &request.agent_id).await {
            warn!(error = %e, "failed to record validation ruling");
        }

        Ok(result)
    }

    /// Append an event through the authenticated write path.
    pub async fn append_event(
        &self,
        session_token: &str,
        agent_id: &AgentId,
        event_type: EventType,
        aggregate_id: &str,
        data: Value,
    ) -> Result<u64, BridgeError> {
        self.authenticate(session_token, agent_id)?;
        let event = self
            .store
            .new_event(event_type, aggregate_id, data, agent_id.clone());
        Ok(self.store.append(event, agent_id).await?)
    }

    /// Run an authenticated query over the log.
    pub async fn query_events(
        &self,
        session_token: &str,
        agent_id: &AgentId,
        query: &EventQuery,
    ) -> Result<QueryResult, BridgeError> {
        self.authenticate(session_token, agent_id)?;
        Ok(self.store.query(query, agent_id).await?)
    }

    /// Create an elicitation addressed to `to_agent`.
    pub async fn create_elicitation(
        &self,
        session_token: &str,
        from_agent: &AgentId,
        to_agent: &AgentId,
        message: &str,
        schema: Value,
        timeout_s: Option<u64>,
    ) -> Result<String, BridgeError> {
        let identity = self.authenticate(session_token, from_agent)?;
        if !identity.has_permission(Permission::Elicit) {
            return Err(AuthzResolution::Denied(AuthzError::PermissionDenied {
                agent: from_agent.to_string(),
                permission: Permission::Elicit,
            })
            .into());
        }
        self.directory.require(to_agent)?;
        let timeout = timeout_s
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.elicitation_default_timeout());
        Ok(self
            .elicitations
            .create(from_agent, to_agent, message, schema, timeout)
            .await?)
    }

    /// Respond to an elicitation as its addressee.
    ///
    /// Returns `Ok(false)` when the responder is not the addressed agent
    /// (recorded as a security incident) and `Ok(true)` on success.
    pub async fn respond_to_elicitation(
        &self,
        session_token: &str,
        responder: &AgentId,
        elicitation_id: &str,
        response_type: ResponseType,
        data: Option<Value>,
    ) -> Result<bool, BridgeError> {
        let identity = self.authenticate(session_token, responder)?;
        if !identity.has_permission(Permission::Respond) {
            return Err(AuthzResolution::Denied(AuthzError::PermissionDenied {
                agent: responder.to_string(),
                permission: Permission::Respond,
            })
            .into());
        }
        match self
            .elicitations
            .respond(elicitation_id, responder, response_type, data)
            .await
        {
            Ok(()) => Ok(true),
            Err(ElicitationError::NotAddressee) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Await an elicitation's terminal outcome as its creator.
    pub async fn await_elicitation(
        &self,
        session_token: &str,
        agent_id: &AgentId,
        elicitation_id: &str,
        cancel: CancellationToken,
    ) -> Result<ElicitationOutcome, BridgeError> {
        self.authenticate(session_token, agent_id)?;
        Ok(self
            .elicitations
            .await_completion(elicitation_id, cancel)
            .await?)
    }

    /// Register the calling agent as an expert.
    pub async fn register_expert(
        &self,
        session_token: &str,
        agent_id: &AgentId,
        registration: ExpertRegistration,
    ) -> Result<ExpertInbox, BridgeError> {
        let identity = self.authenticate(session_token, agent_id)?;
        if !identity.has_permission(Permission::ActAsExpert) {
            return Err(AuthzResolution::Denied(AuthzError::PermissionDenied {
                agent: agent_id.to_string(),
                permission: Permission::ActAsExpert,
            })
            .into());
        }
        let inbox = self
            .coordinator
            .register(registration.clone())
            .map_err(|e| BridgeError::Conflict(e.to_string()))?;
        let event = self.store.new_event(
            EventType::AgentRegistered,
            format!("expert:{}", registration.expert_id),
            json!({
                "expert_id": registration.expert_id,
                "capabilities": registration.capabilities,
                "max_in_flight": registration.max_in_flight,
            }),
            agent_id.clone(),
        );
        if let Err(e) = self.store.append(event, agent_id).await {
            warn!(error = %e, "failed to record expert registration");
        }
        Ok(inbox)
    }

    /// Record an expert heartbeat.
    pub async fn expert_heartbeat(
        &self,
        session_token: &str,
        agent_id: &AgentId,
        expert_id: &str,
    ) -> Result<bool, BridgeError> {
        self.authenticate(session_token, agent_id)?;
        let alive = self.coordinator.heartbeat(expert_id);
        if alive {
            let event = self.store.new_event(
                EventType::AgentHeartbeat,
                format!("expert:{expert_id}"),
                json!({"expert_id": expert_id}),
                agent_id.clone(),
            );
            if let Err(e) = self.store.append(event, agent_id).await {
                warn!(error = %e, "failed to record heartbeat");
            }
        }
        Ok(alive)
    }

    /// Build the structured health report.
    pub async fn get_health(&self) -> HealthReport {
        let event_store = self.store.health().await;
        let cache_stats = self.dispatcher.cache_stats();
        let experts = self
            .coordinator
            .counts_by_status()
            .into_iter()
            .map(|(status, count)| (format!("{status:?}").to_lowercase(), count))
            .collect();
        HealthReport {
            status: event_store.status.clone(),
            timestamp: chrono::Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            event_store,
            active_sessions: self.sessions.active_session_count(),
            experts,
            cache_hit_rate: cache_stats.hit_rate(),
            cache_local_hits: cache_stats.local_hits,
            cache_remote_hits: cache_stats.remote_hits,
            cache_hot_entries: cache_stats.hot_entries,
            pipeline: self.dispatcher.metrics().into(),
            pending_elicitations: self.elicitations.pending_count(),
        }
    }

    /// Cache counters (exposed for the health report and tests).
    pub fn cache_stats(&self) -> lighthouse_cache::CacheStats {
        self.dispatcher.cache_stats()
    }

    /// The event store, for replay and snapshot tooling.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Impersonation attempts rejected by the elicitation manager.
    pub fn elicitation_security_incidents(&self) -> u64 {
        self.elicitations.security_incidents()
    }
}
