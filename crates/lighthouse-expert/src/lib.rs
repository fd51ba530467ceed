#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-expert** – Expert registry and escalation coordination.
//!
//! Experts register with a capability set and a bound on concurrent work;
//! heartbeats keep a registration alive and a stale heartbeat marks the
//! expert offline. Escalated requests are routed to the least-loaded
//! eligible expert through a bounded per-expert queue, awaited up to the
//! call's timeout, and optionally fanned out to several experts whose
//! majority ruling decides (ties block).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lighthouse_speed_layer::{EscalationError, ExpertEscalator, ExpertVerdict};
use lighthouse_types::{Confidence, Decision, RiskLevel, ValidationRequest};

/// Reliability penalty applied when an expert misses a deadline.
const TIMEOUT_PENALTY: f64 = 0.1;

//─────────────────────────────
//  Registry types
//─────────────────────────────

/// Observable lifecycle state of a registered expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStatus {
    /// Heartbeating and below its in-flight bound.
    Available,
    /// Heartbeating but at its in-flight bound.
    Busy,
    /// Heartbeat is stale.
    Offline,
}

/// Registration details for one expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertRegistration {
    /// Unique expert identifier.
    pub expert_id: String,
    /// Capabilities this expert can rule on, e.g. `"shell-review"`.
    pub capabilities: BTreeSet<String>,
    /// Maximum concurrently assigned requests.
    pub max_in_flight: usize,
}

/// Point-in-time view of a registered expert for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertSnapshot {
    /// Unique expert identifier.
    pub expert_id: String,
    /// Registered capabilities.
    pub capabilities: BTreeSet<String>,
    /// Maximum concurrently assigned requests.
    pub max_in_flight: usize,
    /// Currently assigned requests.
    pub current_in_flight: usize,
    /// Last heartbeat, nanoseconds since the Unix epoch.
    pub last_heartbeat_ns: u64,
    /// Derived status.
    pub status: ExpertStatus,
    /// Reliability score in `[0, 1]`, decremented on missed deadlines.
    pub reliability: f64,
}

/// A ruling sent back by an expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertRuling {
    /// The ruling; `Escalate` is treated as a refusal and maps to blocked.
    pub decision: Decision,
    /// Expert confidence.
    pub confidence: Confidence,
    /// Expert reasoning.
    pub reason: String,
}

/// A request assigned to one expert, delivered through its queue.
#[derive(Debug)]
pub struct AssignedRequest {
    /// Unique assignment identifier.
    pub assignment_id: String,
    /// The request under review.
    pub request: ValidationRequest,
    /// Risk assessment from the pipeline.
    pub risk_level: RiskLevel,
    /// Capabilities the escalation asked for.
    pub capabilities: Vec<String>,
    /// Cancelled when the caller gives up.
    pub cancel: CancellationToken,
    /// Send the ruling here; dropping it counts as no response.
    pub respond: oneshot::Sender<ExpertRuling>,
}

/// Queue handle returned to the expert at registration.
pub type ExpertInbox = mpsc::Receiver<AssignedRequest>;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failure modes of expert coordination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    /// No registered, live expert covers the required capabilities.
    #[error("no eligible expert")]
    NoEligibleExpert,
    /// No expert answered within the call timeout.
    #[error("expert timeout")]
    Timeout,
    /// Every candidate queue was full.
    #[error("expert backpressure")]
    Backpressure,
    /// The caller cancelled the escalation.
    #[error("escalation cancelled")]
    Cancelled,
    /// The expert id is already registered.
    #[error("expert {0} already registered")]
    AlreadyRegistered(String),
}

//─────────────────────────────
//  Coordinator
//─────────────────────────────

/// Escalation payload handed to the coordinator.
#[derive(Debug, Clone)]
pub struct Escalation {
    /// The request under review.
    pub request: ValidationRequest,
    /// Risk assessment from the pipeline.
    pub risk_level: RiskLevel,
    /// Capabilities the ruling requires.
    pub required_capabilities: Vec<String>,
    /// Per-call response deadline.
    pub timeout: Duration,
}

/// Aggregated outcome of one escalation.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationOutcome {
    /// Majority (or sole) ruling.
    pub decision: Decision,
    /// Lowest confidence among contributing rulings.
    pub confidence: Confidence,
    /// Reasoning, joined across contributors.
    pub reason: String,
    /// Experts that contributed rulings.
    pub expert_ids: Vec<String>,
}

struct ExpertEntry {
    capabilities: BTreeSet<String>,
    max_in_flight: usize,
    in_flight: AtomicUsize,
    last_heartbeat_ns: AtomicU64,
    reliability_bits: AtomicU64,
    queue: mpsc::Sender<AssignedRequest>,
}

impl ExpertEntry {
    fn reliability(&self) -> f64 {
        f64::from_bits(self.reliability_bits.load(Ordering::Relaxed))
    }

    fn penalise(&self) {
        let current = self.reliability();
        let next = (current - TIMEOUT_PENALTY).max(0.0);
        self.reliability_bits.store(next.to_bits(), Ordering::Relaxed);
    }
}

/// Routes escalations to registered experts.
pub struct ExpertCoordinator {
    experts: DashMap<String, Arc<ExpertEntry>>,
    heartbeat_window: Duration,
    queue_capacity: usize,
}

impl std::fmt::Debug for ExpertCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertCoordinator")
            .field("experts", &self.experts.len())
            .finish_non_exhaustive()
    }
}

impl ExpertCoordinator {
    /// Create a coordinator. `heartbeat_window` bounds how stale a heartbeat
    /// may be before the expert is considered offline; `queue_capacity`
    /// bounds each expert's pending assignments.
    pub fn new(heartbeat_window: Duration, queue_capacity: usize) -> Self {
        Self {
            experts: DashMap::new(),
            heartbeat_window,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register an expert, returning its assignment inbox.
    pub fn register(
        &self,
        registration: ExpertRegistration,
    ) -> Result<ExpertInbox, CoordinationError> {
        if self.experts.contains_key(&registration.expert_id) {
            return Err(CoordinationError::AlreadyRegistered(
                registration.expert_id,
            ));
        }
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let entry = Arc::new(ExpertEntry {
            capabilities: registration.capabilities,
            max_in_flight: registration.max_in_flight.max(1),
            in_flight: AtomicUsize::new(0),
            last_heartbeat_ns: AtomicU64::new(now_ns()),
            reliability_bits: AtomicU64::new(1.0f64.to_bits()),
            queue: tx,
        });
        info!(expert = %registration.expert_id, "expert registered");
        self.experts.insert(registration.expert_id, entry);
        Ok(rx)
    }

    /// Record a liveness signal from `expert_id`.
    pub fn heartbeat(&self, expert_id: &str) -> bool {
        match self.experts.get(expert_id) {
            Some(entry) => {
                entry.last_heartbeat_ns.store(now_ns(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Remove an expert from the registry.
    pub fn deregister(&self, expert_id: &str) -> bool {
        let removed = self.experts.remove(expert_id).is_some();
        if removed {
            info!(expert = expert_id, "expert deregistered");
        }
        removed
    }

    fn status_of(&self, entry: &ExpertEntry) -> ExpertStatus {
        let stale = now_ns().saturating_sub(entry.last_heartbeat_ns.load(Ordering::Relaxed))
            > self.heartbeat_window.as_nanos() as u64;
        if stale {
            ExpertStatus::Offline
        } else if entry.in_flight.load(Ordering::Relaxed) >= entry.max_in_flight {
            ExpertStatus::Busy
        } else {
            ExpertStatus::Available
        }
    }

    /// Snapshot every registration for health reporting.
    pub fn snapshot(&self) -> Vec<ExpertSnapshot> {
        let mut snapshots: Vec<ExpertSnapshot> = self
            .experts
            .iter()
            .map(|item| {
                let entry = item.value();
                ExpertSnapshot {
                    expert_id: item.key().clone(),
                    capabilities: entry.capabilities.clone(),
                    max_in_flight: entry.max_in_flight,
                    current_in_flight: entry.in_flight.load(Ordering::Relaxed),
                    last_heartbeat_ns: entry.last_heartbeat_ns.load(Ordering::Relaxed),
                    status: self.status_of(entry),
                    reliability: entry.reliability(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.expert_id.cmp(&b.expert_id));
        snapshots
    }

    /// Expert counts keyed by status, for the health report.
    pub fn counts_by_status(&self) -> HashMap<ExpertStatus, usize> {
        let mut counts = HashMap::new();
        for item in self.experts.iter() {
            *counts.entry(self.status_of(item.value())).or_insert(0) += 1;
        }
        counts
    }

    /// Eligible candidates for `capabilities`, least-loaded first with a
    /// deterministic id tie-break.
    fn candidates(&self, capabilities: &[String]) -> Vec<(String, Arc<ExpertEntry>)> {
        let required: BTreeSet<&str> = capabilities.iter().map(|c| c.as_str()).collect();
        let mut eligible: Vec<(String, Arc<ExpertEntry>)> = self
            .experts
            .iter()
            .filter(|item| {
                let entry = item.value();
                self.status_of(entry) == ExpertStatus::Available
                    && required.iter().all(|c| entry.capabilities.contains(*c))
            })
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();
        eligible.sort_by(|(id_a, a), (id_b, b)| {
            a.in_flight
                .load(Ordering::Relaxed)
                .cmp(&b.in_flight.load(Ordering::Relaxed))
                .then_with(|| id_a.cmp(id_b))
        });
        eligible
    }

    /// Route `escalation` to `consensus` distinct experts and aggregate.
    ///
    /// With `consensus == 1` the single ruling decides. With a larger
    /// consensus the majority decision wins and ties block. Experts that
    /// miss the deadline have their reliability score decremented.
    pub async fn coordinate(
        &self,
        escalation: Escalation,
        consensus: usize,
        cancel: CancellationToken,
    ) -> Result<CoordinationOutcome, CoordinationError> {
        let consensus = consensus.max(1);
        let candidates = self.candidates(&escalation.required_capabilities);
        if candidates.is_empty() {
            return Err(CoordinationError::NoEligibleExpert);
        }
        let chosen: Vec<(String, Arc<ExpertEntry>)> =
            candidates.into_iter().take(consensus).collect();
        if chosen.len() < consensus {
            return Err(CoordinationError::NoEligibleExpert);
        }

        let mut pending = Vec::with_capacity(chosen.len());
        for (expert_id, entry) in &chosen {
            let (reply_tx, reply_rx) = oneshot::channel();
            let assignment = AssignedRequest {
                assignment_id: uuid::Uuid::new_v4().simple().to_string(),
                request: escalation.request.clone(),
                risk_level: escalation.risk_level,
                capabilities: escalation.required_capabilities.clone(),
                cancel: cancel.child_token(),
                respond: reply_tx,
            };
            match entry.queue.try_send(assignment) {
                Ok(()) => {
                    entry.in_flight.fetch_add(1, Ordering::Relaxed);
                    pending.push((expert_id.clone(), Arc::clone(entry), reply_rx));
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(expert = %expert_id, "expert queue full");
                    self.settle(&pending);
                    return Err(CoordinationError::Backpressure);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The expert dropped its inbox; treat as gone.
                    self.deregister(expert_id);
                    self.settle(&pending);
                    return Err(CoordinationError::NoEligibleExpert);
                }
            }
        }

        let replies = {
            let awaited = join_all(pending.iter_mut().map(|(_, _, rx)| rx));
            let deadline = tokio::time::timeout(escalation.timeout, awaited);
            tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = deadline => Some(outcome),
            }
        };
        let Some(replies) = replies else {
            self.settle(&pending);
            return Err(CoordinationError::Cancelled);
        };

        let replies = match replies {
            Ok(replies) => replies,
            Err(_) => {
                for (expert_id, entry, _) in &pending {
                    entry.penalise();
                    debug!(expert = %expert_id, "expert missed deadline");
                }
                self.settle(&pending);
                return Err(CoordinationError::Timeout);
            }
        };
        self.settle(&pending);

        let mut rulings = Vec::new();
        for ((expert_id, entry, _), reply) in pending.iter().zip(replies) {
            match reply {
                Ok(ruling) => rulings.push((expert_id.clone(), ruling)),
                Err(_) => {
                    entry.penalise();
                    warn!(expert = %expert_id, "expert dropped assignment without replying");
                }
            }
        }
        if rulings.is_empty() {
            return Err(CoordinationError::Timeout);
        }

        Ok(aggregate(rulings))
    }

    fn settle(&self, pending: &[(String, Arc<ExpertEntry>, oneshot::Receiver<ExpertRuling>)]) {
        for (_, entry, _) in pending {
            entry.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Majority aggregation; an `Escalate` ruling counts as a refusal to
/// approve, and ties always block.
fn aggregate(rulings: Vec<(String, ExpertRuling)>) -> CoordinationOutcome {
    let mut approvals = 0usize;
    let mut blocks = 0usize;
    let mut confidence = Confidence::High;
    let mut reasons = Vec::new();
    let mut expert_ids = Vec::new();

    for (expert_id, ruling) in &rulings {
        match ruling.decision {
            Decision::Approved => approvals += 1,
            Decision::Blocked | Decision::Escalate => blocks += 1,
        }
        confidence = confidence.min(ruling.confidence);
        reasons.push(format!("{expert_id}: {}", ruling.reason));
        expert_ids.push(expert_id.clone());
    }

    let decision = if approvals > blocks {
        Decision::Approved
    } else {
        Decision::Blocked
    };
    CoordinationOutcome {
        decision,
        confidence,
        reason: reasons.join("; "),
        expert_ids,
    }
}

//─────────────────────────────
//  Speed-layer boundary adapter
//─────────────────────────────

/// Adapts the coordinator to the speed layer's escalation boundary.
pub struct CoordinatorEscalator {
    coordinator: Arc<ExpertCoordinator>,
    timeout: Duration,
    default_consensus: usize,
}

impl CoordinatorEscalator {
    /// Wrap `coordinator` with the deployment's default timeout and
    /// consensus size.
    pub fn new(
        coordinator: Arc<ExpertCoordinator>,
        timeout: Duration,
        default_consensus: usize,
    ) -> Self {
        Self {
            coordinator,
            timeout,
            default_consensus: default_consensus.max(1),
        }
    }
}

#[async_trait]
impl ExpertEscalator for CoordinatorEscalator {
    async fn escalate(
        &self,
        request: &ValidationRequest,
        risk_level: RiskLevel,
        capabilities: &[String],
        cancel: CancellationToken,
    ) -> Result<ExpertVerdict, EscalationError> {
        let escalation = Escalation {
            request: request.clone(),
            risk_level,
            required_capabilities: capabilities.to_vec(),
            timeout: self.timeout,
        };
        let outcome = self
            .coordinator
            .coordinate(escalation, self.default_consensus, cancel)
            .await
            .map_err(|e| match e {
                CoordinationError::NoEligibleExpert => EscalationError::NoEligibleExpert,
                CoordinationError::Timeout => EscalationError::Timeout,
                CoordinationError::Backpressure => EscalationError::Backpressure,
                CoordinationError::Cancelled => EscalationError::Cancelled,
                other => EscalationError::Internal(other.to_string()),
            })?;
        Ok(ExpertVerdict {
            decision: outcome.decision,
            confidence: outcome.confidence,
            reason: outcome.reason,
            expert_ids: outcome.expert_ids,
        })
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
    use lighthouse_types::AgentId;
    use serde_json::json;

    fn registration(id: &str, capability: &str, max_in_flight: usize) -> ExpertRegistration {
        ExpertRegistration {
            expert_id: id.to_string(),
            capabilities: [capability.to_string()].into_iter().collect(),
            max_in_flight,
        }
    }

    fn escalation(timeout: Duration) -> Escalation {
        Escalation {
            request: ValidationRequest::new(
                "Bash",
                json!({"command": "sudo apt update"}),
                AgentId::new("carol").unwrap(),
                "s1",
            ),
            risk_level: RiskLevel::Medium,
            required_capabilities: vec!["shell-review".to_string()],
            timeout,
        }
    }

    fn spawn_expert(mut inbox: ExpertInbox, decision: Decision) {
        tokio::spawn(async move {
            while let Some(assignment) = inbox.recv().await {
                let _ = assignment.respond.send(ExpertRuling {
                    decision,
                    confidence: Confidence::High,
                    reason: "reviewed".to_string(),
                });
            }
        });
    }

    #[tokio::test]
    async fn routes_to_capable_expert() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        let inbox = coordinator
            .register(registration("expert-1", "shell-review", 4))
            .unwrap();
        spawn_expert(inbox, Decision::Approved);

        let outcome = coordinator
            .coordinate(
                escalation(Duration::from_secs(5)),
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Approved);
        assert_eq!(outcome.expert_ids, vec!["expert-1".to_string()]);
    }

    #[tokio::test]
    async fn no_capable_expert_fails() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        let inbox = coordinator
            .register(registration("expert-1", "file-review", 4))
            .unwrap();
        spawn_expert(inbox, Decision::Approved);

        let err = coordinator
            .coordinate(
                escalation(Duration::from_secs(1)),
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::NoEligibleExpert);
    }

    #[tokio::test]
    async fn timeout_penalises_reliability() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        // Register but never consume the inbox: the expert goes silent.
        let _inbox = coordinator
            .register(registration("expert-1", "shell-review", 4))
            .unwrap();

        let err = coordinator
            .coordinate(
                escalation(Duration::from_millis(50)),
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::Timeout);

        let snapshot = coordinator.snapshot();
        assert!(snapshot[0].reliability < 1.0);
        assert_eq!(snapshot[0].current_in_flight, 0);
    }

    #[tokio::test]
    async fn least_loaded_routing_with_deterministic_tiebreak() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        let a = coordinator
            .register(registration("expert-a", "shell-review", 4))
            .unwrap();
        let b = coordinator
            .register(registration("expert-b", "shell-review", 4))
            .unwrap();
        spawn_expert(a, Decision::Approved);
        spawn_expert(b, Decision::Blocked);

        // Equal load: the id tie-break selects expert-a deterministically.
        let outcome = coordinator
            .coordinate(
                escalation(Duration::from_secs(5)),
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.expert_ids, vec!["expert-a".to_string()]);
    }

    #[tokio::test]
    async fn consensus_majority_decides_and_ties_block() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        let a = coordinator
            .register(registration("expert-a", "shell-review", 4))
            .unwrap();
        let b = coordinator
            .register(registration("expert-b", "shell-review", 4))
            .unwrap();
        spawn_expert(a, Decision::Approved);
        spawn_expert(b, Decision::Blocked);

        // 1 approve + 1 block is a tie: blocked.
        let outcome = coordinator
            .coordinate(
                escalation(Duration::from_secs(5)),
                2,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Blocked);
        assert_eq!(outcome.expert_ids.len(), 2);

        // A third approver breaks the majority toward approval.
        let c = coordinator
            .register(registration("expert-c", "shell-review", 4))
            .unwrap();
        spawn_expert(c, Decision::Approved);
        let outcome = coordinator
            .coordinate(
                escalation(Duration::from_secs(5)),
                3,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Approved);
    }

    #[tokio::test]
    async fn consensus_larger_than_pool_fails() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        let inbox = coordinator
            .register(registration("expert-1", "shell-review", 4))
            .unwrap();
        spawn_expert(inbox, Decision::Approved);

        let err = coordinator
            .coordinate(
                escalation(Duration::from_secs(1)),
                3,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::NoEligibleExpert);
    }

    #[tokio::test]
    async fn backpressure_when_queue_full() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 1);
        // Inbox retained but never drained, so the single queue slot fills.
        let _inbox = coordinator
            .register(registration("expert-1", "shell-review", 8))
            .unwrap();

        let first = coordinator.coordinate(
            escalation(Duration::from_millis(200)),
            1,
            CancellationToken::new(),
        );
        let second = coordinator.coordinate(
            escalation(Duration::from_millis(200)),
            1,
            CancellationToken::new(),
        );
        let (first, second) = tokio::join!(first, second);
        let errors = [first.unwrap_err(), second.unwrap_err()];
        assert!(errors.contains(&CoordinationError::Backpressure));
    }

    #[tokio::test]
    async fn stale_heartbeat_marks_offline() {
        let coordinator = ExpertCoordinator::new(Duration::from_millis(10), 16);
        let inbox = coordinator
            .register(registration("expert-1", "shell-review", 4))
            .unwrap();
        spawn_expert(inbox, Decision::Approved);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            coordinator.counts_by_status().get(&ExpertStatus::Offline),
            Some(&1)
        );
        let err = coordinator
            .coordinate(
                escalation(Duration::from_secs(1)),
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::NoEligibleExpert);

        // A heartbeat revives the expert.
        assert!(coordinator.heartbeat("expert-1"));
        assert!(coordinator
            .coordinate(
                escalation(Duration::from_secs(5)),
                1,
                CancellationToken::new(),
            )
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        coordinator
            .register(registration("expert-1", "shell-review", 4))
            .unwrap();
        let err = coordinator
            .register(registration("expert-1", "shell-review", 4))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn cancellation_releases_in_flight() {
        let coordinator = ExpertCoordinator::new(Duration::from_secs(60), 16);
        let _inbox = coordinator
            .register(registration("expert-1", "shell-review", 4))
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = coordinator
            .coordinate(escalation(Duration::from_secs(5)), 1, cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinationError::Cancelled);
        assert_eq!(coordinator.snapshot()[0].current_in_flight, 0);
    }
}
