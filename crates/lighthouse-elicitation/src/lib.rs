#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-elicitation** – Push-mode request/response between agents.
//!
//! An elicitation is created pending, transitions exactly once to a terminal
//! state (accepted, declined, cancelled, or expired), and is retained for
//! audit afterwards. Only the declared addressee may respond; accepted
//! payloads are validated against the declared JSON schema before storage,
//! and every response carries an HMAC binding (elicitation id, responder,
//! payload) so an auditor replaying the event log can verify provenance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lighthouse_event_core::{EventSigner, EventType};
use lighthouse_event_store::EventStore;
use lighthouse_types::{canonical_json, AgentId};

//─────────────────────────────
//  Model
//─────────────────────────────

/// Lifecycle state of an elicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationStatus {
    /// Awaiting a response.
    Pending,
    /// Addressee accepted with a conforming payload.
    Accepted,
    /// Addressee declined.
    Declined,
    /// Cancelled by the creator or the addressee.
    Cancelled,
    /// Deadline passed without a response.
    Expired,
}

/// Kind of response an addressee may give.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Provide the requested data.
    Accept,
    /// Refuse to answer.
    Decline,
    /// Withdraw the exchange.
    Cancel,
}

/// One agent-to-agent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Elicitation {
    /// Unique identifier, single-use.
    pub elicitation_id: String,
    /// Requesting agent.
    pub from_agent: AgentId,
    /// The only agent allowed to respond.
    pub to_agent: AgentId,
    /// Human-readable request.
    pub message: String,
    /// JSON Schema the accepted payload must conform to.
    pub schema: Value,
    /// Creation time, nanoseconds since the Unix epoch.
    pub created_at_ns: u64,
    /// Deadline, nanoseconds since the Unix epoch.
    pub expires_at_ns: u64,
    /// Lifecycle state.
    pub status: ElicitationStatus,
    /// Accepted payload, if any.
    pub response_data: Option<Value>,
    /// HMAC over (elicitation id, responder, payload).
    pub response_signature: Option<String>,
}

/// Terminal outcome delivered to the awaiting creator.
#[derive(Debug, Clone, PartialEq)]
pub enum ElicitationOutcome {
    /// The addressee accepted with this payload.
    Accepted(Value),
    /// The addressee declined.
    Declined,
    /// The exchange was cancelled.
    Cancelled,
    /// The deadline passed.
    Expired,
}

/// Errors surfaced by the manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElicitationError {
    /// Unknown elicitation id.
    #[error("elicitation not found")]
    NotFound,
    /// A terminal transition already happened.
    #[error("elicitation already resolved")]
    AlreadyResolved,
    /// The responder is not the declared addressee.
    #[error("responder is not the addressed agent")]
    NotAddressee,
    /// The accepted payload does not conform to the declared schema.
    #[error("response does not conform to schema: {0}")]
    SchemaViolation(String),
    /// The declared schema itself is invalid.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    /// The deadline passed before a response arrived.
    #[error("elicitation expired")]
    Expired,
    /// The creator cancelled the await.
    #[error("elicitation cancelled")]
    Cancelled,
    /// `await_completion` was called twice for the same id.
    #[error("elicitation is already being awaited")]
    AlreadyAwaited,
    /// The event store refused the transition event.
    #[error("event store failure: {0}")]
    Store(String),
}

//─────────────────────────────
//  Manager
//─────────────────────────────

struct Entry {
    state: Mutex<Elicitation>,
    waiter: Mutex<Option<oneshot::Sender<ElicitationOutcome>>>,
    receiver: Mutex<Option<oneshot::Receiver<ElicitationOutcome>>>,
}

impl Entry {
    /// Move to `status` if still pending; the single winner gets `true`.
    fn claim(&self, status: ElicitationStatus) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.status != ElicitationStatus::Pending {
            return false;
        }
        state.status = status;
        true
    }

    fn wake(&self, outcome: ElicitationOutcome) {
        let sender = self
            .waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

/// Creates, resolves, and awaits elicitations, persisting every transition
/// to the event store.
pub struct ElicitationManager {
    store: Arc<EventStore>,
    signer: EventSigner,
    system_agent: AgentId,
    entries: DashMap<String, Arc<Entry>>,
    security_incidents: AtomicU64,
    retention: Duration,
}

impl std::fmt::Debug for ElicitationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElicitationManager")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl ElicitationManager {
    /// Create a manager. `system_agent` is the principal used for expiry and
    /// incident events and must hold write permission in the store's
    /// directory. Terminal elicitations are pruned after `retention`.
    pub fn new(
        store: Arc<EventStore>,
        signer: EventSigner,
        system_agent: AgentId,
        retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            signer,
            system_agent,
            entries: DashMap::new(),
            security_incidents: AtomicU64::new(0),
            retention,
        })
    }

    /// Create an elicitation from `from` to `to`, returning its id.
    ///
    /// Persists `elicitation_created` and schedules expiry at the deadline.
    pub async fn create(
        self: &Arc<Self>,
        from: &AgentId,
        to: &AgentId,
        message: impl Into<String>,
        schema: Value,
        timeout: Duration,
    ) -> Result<String, ElicitationError> {
        // Reject unusable schemas at the boundary rather than at respond time.
        JSONSchema::compile(&schema)
            .map_err(|e| ElicitationError::InvalidSchema(e.to_string()))?;

        self.prune_terminal();

        let elicitation_id = uuid::Uuid::new_v4().simple().to_string();
        let message = message.into();
        let event = self.store.new_event(
            EventType::ElicitationCreated,
            format!("elicitation:{elicitation_id}"),
            json!({
                "elicitation_id": elicitation_id,
                "from_agent": from,
                "to_agent": to,
                "message": message,
                "schema": schema,
                "timeout_s": timeout.as_secs(),
            }),
            from.clone(),
        );
        let created_at_ns = event.timestamp_ns;
        let expires_at_ns = created_at_ns + timeout.as_nanos() as u64;

        self.store
            .append(event, from)
            .await
            .map_err(|e| ElicitationError::Store(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(Entry {
            state: Mutex::new(Elicitation {
                elicitation_id: elicitation_id.clone(),
                from_agent: from.clone(),
                to_agent: to.clone(),
                message,
                schema,
                created_at_ns,
                expires_at_ns,
                status: ElicitationStatus::Pending,
                response_data: None,
                response_signature: None,
            }),
            waiter: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        });
        self.entries.insert(elicitation_id.clone(), entry);

        // Expiry fires even when nobody is awaiting.
        let manager = Arc::clone(self);
        let id = elicitation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.expire(&id).await;
        });

        info!(elicitation = %elicitation_id, from = %from, to = %to, "elicitation created");
        Ok(elicitation_id)
    }

    /// Respond to a pending elicitation.
    ///
    /// Fails without mutating state when the responder is not the declared
    /// addressee (counted as a security incident), when the payload violates
    /// the schema, or when another response already won.
    pub async fn respond(
        &self,
        elicitation_id: &str,
        responder: &AgentId,
        response_type: ResponseType,
        data: Option<Value>,
    ) -> Result<(), ElicitationError> {
        let entry = self
            .entries
            .get(elicitation_id)
            .map(|e| Arc::clone(&e))
            .ok_or(ElicitationError::NotFound)?;

        let (to_agent, schema) = {
            let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.to_agent.clone(), state.schema.clone())
        };

        if *responder != to_agent {
            self.security_incidents.fetch_add(1, Ordering::Relaxed);
            warn!(
                elicitation = elicitation_id,
                responder = %responder,
                addressee = %to_agent,
                "rejected response from non-addressed agent"
            );
            let incident = self.store.new_event(
                EventType::SecurityIncident,
                format!("elicitation:{elicitation_id}"),
                json!({
                    "kind": "elicitation_impersonation",
                    "elicitation_id": elicitation_id,
                    "claimed_responder": responder,
                    "addressee": to_agent,
                }),
                self.system_agent.clone(),
            );
            if let Err(e) = self.store.append(incident, &self.system_agent).await {
                warn!(error = %e, "failed to record impersonation incident");
            }
            return Err(ElicitationError::NotAddressee);
        }

        let (status, outcome, payload) = match response_type {
            ResponseType::Accept => {
                let payload = data.unwrap_or(Value::Null);
                let compiled = JSONSchema::compile(&schema)
                    .map_err(|e| ElicitationError::InvalidSchema(e.to_string()))?;
                if let Err(errors) = compiled.validate(&payload) {
                    let detail = errors
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(ElicitationError::SchemaViolation(detail));
                }
                (
                    ElicitationStatus::Accepted,
                    ElicitationOutcome::Accepted(payload.clone()),
                    Some(payload),
                )
            }
            ResponseType::Decline => {
                (ElicitationStatus::Declined, ElicitationOutcome::Declined, None)
            }
            ResponseType::Cancel => {
                (ElicitationStatus::Cancelled, ElicitationOutcome::Cancelled, None)
            }
        };

        if !entry.claim(status) {
            return Err(ElicitationError::AlreadyResolved);
        }

        let signature = self.response_signature(elicitation_id, responder, payload.as_ref());
        {
            let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
            state.response_data = payload.clone();
            state.response_signature = Some(signature.clone());
        }

        let event = self.store.new_event(
            EventType::ElicitationResponded,
            format!("elicitation:{elicitation_id}"),
            json!({
                "elicitation_id": elicitation_id,
                "responder": responder,
                "response_type": response_type,
                "data": payload,
                "response_signature": signature,
            }),
            responder.clone(),
        );
        if let Err(e) = self.store.append(event, responder).await {
            warn!(error = %e, "failed to persist elicitation response");
        }

        entry.wake(outcome);
        debug!(elicitation = elicitation_id, ?response_type, "elicitation resolved");
        Ok(())
    }

    /// Await the terminal outcome as the creator, up to the declared
    /// deadline. Cancelling `cancel` transitions a still-pending elicitation
    /// to cancelled and releases the awaiter.
    pub async fn await_completion(
        &self,
        elicitation_id: &str,
        cancel: CancellationToken,
    ) -> Result<ElicitationOutcome, ElicitationError> {
        let entry = self
            .entries
            .get(elicitation_id)
            .map(|e| Arc::clone(&e))
            .ok_or(ElicitationError::NotFound)?;

        let receiver = entry
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ElicitationError::AlreadyAwaited)?;

        tokio::select! {
            outcome = receiver => match outcome {
                Ok(ElicitationOutcome::Expired) => Err(ElicitationError::Expired),
                Ok(outcome) => Ok(outcome),
                Err(_) => Err(ElicitationError::Cancelled),
            },
            _ = cancel.cancelled() => {
                if entry.claim(ElicitationStatus::Cancelled) {
                    let event = self.store.new_event(
                        EventType::ElicitationExpired,
                        format!("elicitation:{elicitation_id}"),
                        json!({
                            "elicitation_id": elicitation_id,
                            "reason": "cancelled_by_creator",
                        }),
                        self.system_agent.clone(),
                    );
                    if let Err(e) = self.store.append(event, &self.system_agent).await {
                        warn!(error = %e, "failed to persist elicitation cancellation");
                    }
                }
                Err(ElicitationError::Cancelled)
            }
        }
    }

    /// Expire a still-pending elicitation; called by the deadline task.
    async fn expire(&self, elicitation_id: &str) {
        let Some(entry) = self.entries.get(elicitation_id).map(|e| Arc::clone(&e)) else {
            return;
        };
        if !entry.claim(ElicitationStatus::Expired) {
            return;
        }
        let event = self.store.new_event(
            EventType::ElicitationExpired,
            format!("elicitation:{elicitation_id}"),
            json!({"elicitation_id": elicitation_id, "reason": "timeout"}),
            self.system_agent.clone(),
        );
        if let Err(e) = self.store.append(event, &self.system_agent).await {
            warn!(error = %e, "failed to persist elicitation expiry");
        }
        entry.wake(ElicitationOutcome::Expired);
        info!(elicitation = elicitation_id, "elicitation expired");
    }

    /// Current state of an elicitation, if still retained.
    pub fn get(&self, elicitation_id: &str) -> Option<Elicitation> {
        self.entries.get(elicitation_id).map(|entry| {
            entry
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }

    /// Number of pending elicitations.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| {
                entry
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .status
                    == ElicitationStatus::Pending
            })
            .count()
    }

    /// Impersonation attempts rejected so far.
    pub fn security_incidents(&self) -> u64 {
        self.security_incidents.load(Ordering::Relaxed)
    }

    /// The HMAC binding a response to its elicitation and responder.
    pub fn response_signature(
        &self,
        elicitation_id: &str,
        responder: &AgentId,
        data: Option<&Value>,
    ) -> String {
        let canonical = data.map(canonical_json).unwrap_or_default();
        self.signer.sign_detached(&[
            elicitation_id.as_bytes(),
            responder.as_str().as_bytes(),
            canonical.as_bytes(),
        ])
    }

    /// Verify a response signature recovered from the event log.
    pub fn verify_response_signature(
        &self,
        elicitation_id: &str,
        responder: &AgentId,
        data: Option<&Value>,
        signature: &str,
    ) -> bool {
        let canonical = data.map(canonical_json).unwrap_or_default();
        self.signer.verify_detached(
            &[
                elicitation_id.as_bytes(),
                responder.as_str().as_bytes(),
                canonical.as_bytes(),
            ],
            signature,
        )
    }

    /// Drop terminal elicitations older than the retention horizon.
    fn prune_terminal(&self) {
        let now = now_ns();
        let retention_ns = self.retention.as_nanos() as u64;
        self.entries.retain(|_, entry| {
            let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
            state.status == ElicitationStatus::Pending
                || now.saturating_sub(state.expires_at_ns) < retention_ns
        });
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
