#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-speed-layer** – Three-tier cached validation pipeline.
//!
//! `validate` runs a request through the tiered cache, the policy table, the
//! pattern rules, and the optional ML scorer, escalating to the expert
//! coordinator only when no tier produced a confident ruling. Tier failures
//! are isolated: a failing tier is skipped and counted, and when the whole
//! pipeline is unable to produce an answer the request is blocked rather
//! than approved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lighthouse_cache::TieredCache;
use lighthouse_types::{
    AgentRole, CacheLayer, Confidence, Decision, RiskLevel, ValidationRequest, ValidationResult,
};

mod tiers;

pub use tiers::{MlTier, PatternTier, PolicyTier, TierVerdict};

//─────────────────────────────
//  Escalation boundary
//─────────────────────────────

/// A ruling produced by one or more experts.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertVerdict {
    /// Final ruling (never `Escalate`).
    pub decision: Decision,
    /// Expert confidence.
    pub confidence: Confidence,
    /// Expert reasoning.
    pub reason: String,
    /// Experts that contributed to the ruling.
    pub expert_ids: Vec<String>,
}

/// Failure modes of an escalation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EscalationError {
    /// No registered expert covers the required capabilities.
    #[error("no eligible expert")]
    NoEligibleExpert,
    /// The expert did not answer within the configured window.
    #[error("expert timeout")]
    Timeout,
    /// The selected expert's queue is full.
    #[error("expert backpressure")]
    Backpressure,
    /// The escalation was cancelled by the caller.
    #[error("escalation cancelled")]
    Cancelled,
    /// Coordinator-internal failure.
    #[error("coordination failure: {0}")]
    Internal(String),
}

/// Boundary to the expert coordinator.
#[async_trait]
pub trait ExpertEscalator: Send + Sync {
    /// Route `request` to an expert holding `capabilities` and await the
    /// ruling. Implementations must honour `cancel` promptly.
    async fn escalate(
        &self,
        request: &ValidationRequest,
        risk_level: RiskLevel,
        capabilities: &[String],
        cancel: CancellationToken,
    ) -> Result<ExpertVerdict, EscalationError>;
}

/// Capability an escalated request requires, derived from its tool.
pub fn required_capability(tool_name: &str) -> &'static str {
    match tool_name {
        "Bash" => "shell-review",
        "Write" | "Edit" | "MultiEdit" | "Read" | "Glob" | "Grep" | "LS" => "file-review",
        _ => "general-review",
    }
}

//─────────────────────────────
//  Errors & configuration
//─────────────────────────────

/// Errors surfaced by `validate`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeedLayerError {
    /// The caller cancelled the validation.
    #[error("validation cancelled")]
    Cancelled,
}

/// Confidence thresholds and escalation knobs.
///
/// The floors are configuration rather than constants: deployments tune how
/// strong a pattern or ML signal must be before it decides a request without
/// expert review.
#[derive(Debug, Clone)]
pub struct SpeedLayerConfig {
    /// Minimum confidence for a pattern-tier verdict to become final.
    pub pattern_confidence_floor: Confidence,
    /// Minimum confidence for an ML verdict to become final.
    pub ml_confidence_floor: Confidence,
}

impl Default for SpeedLayerConfig {
    fn default() -> Self {
        Self {
            pattern_confidence_floor: Confidence::Medium,
            ml_confidence_floor: Confidence::High,
        }
    }
}

/// Per-tier hit and failure counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeedLayerMetrics {
    /// Requests settled by the cache.
    pub cache_hits: u64,
    /// Requests settled by the policy tier.
    pub policy_hits: u64,
    /// Requests settled by the pattern tier.
    pub pattern_hits: u64,
    /// Requests settled by the ML tier.
    pub ml_hits: u64,
    /// Requests escalated to experts.
    pub escalations: u64,
    /// Tier invocations that errored and were skipped.
    pub tier_errors: u64,
    /// Requests blocked because the pipeline could not answer.
    pub fail_closed: u64,
}

//─────────────────────────────
//  Dispatcher
//─────────────────────────────

/// The validation pipeline.
pub struct SpeedLayerDispatcher {
    cache: Arc<TieredCache>,
    policy: PolicyTier,
    pattern: PatternTier,
    ml: Option<Arc<dyn MlTier>>,
    escalator: Option<Arc<dyn ExpertEscalator>>,
    config: SpeedLayerConfig,
    cache_hits: AtomicU64,
    policy_hits: AtomicU64,
    pattern_hits: AtomicU64,
    ml_hits: AtomicU64,
    escalations: AtomicU64,
    tier_errors: AtomicU64,
    fail_closed: AtomicU64,
}

impl std::fmt::Debug for SpeedLayerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedLayerDispatcher")
            .field("has_ml", &self.ml.is_some())
            .field("has_escalator", &self.escalator.is_some())
            .finish_non_exhaustive()
    }
}

impl SpeedLayerDispatcher {
    /// Assemble the pipeline.
    pub fn new(
        cache: Arc<TieredCache>,
        ml: Option<Arc<dyn MlTier>>,
        escalator: Option<Arc<dyn ExpertEscalator>>,
        config: SpeedLayerConfig,
    ) -> Self {
        Self {
            cache,
            policy: PolicyTier,
            pattern: PatternTier,
            ml,
            escalator,
            config,
            cache_hits: AtomicU64::new(0),
            policy_hits: AtomicU64::new(0),
            pattern_hits: AtomicU64::new(0),
            ml_hits: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            tier_errors: AtomicU64::new(0),
            fail_closed: AtomicU64::new(0),
        }
    }

    /// Validate a request, consulting tiers in order and escalating when no
    /// tier is confident enough. The final decision is never `Approved` on an
    /// internal failure.
    pub async fn validate(
        &self,
        request: &ValidationRequest,
        role: AgentRole,
        cancel: CancellationToken,
    ) -> Result<ValidationResult, SpeedLayerError> {
        let started = Instant::now();
        let fingerprint = request.fingerprint(role);

        // Tier 0: memoised results from this or any equivalent request.
        if let Some(mut hit) = self.cache.get(&fingerprint).await {
            if hit.confidence == Confidence::High {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                hit.request_id = request.request_id.clone();
                hit.processing_time_ms = elapsed_ms(started);
                return Ok(hit);
            }
        }

        if cancel.is_cancelled() {
            return Err(SpeedLayerError::Cancelled);
        }

        // Tier 1: policy table. Its verdicts are authoritative.
        if let Some(verdict) = self.policy.evaluate(request) {
            if verdict.decision != Decision::Escalate {
                self.policy_hits.fetch_add(1, Ordering::Relaxed);
                let result = self.finish(request, verdict, &fingerprint, started).await;
                return Ok(result);
            }
        }

        // Tier 2: pattern rules at medium confidence.
        if let Some(verdict) = self.pattern.evaluate(request) {
            if verdict.decision != Decision::Escalate
                && verdict.confidence >= self.config.pattern_confidence_floor
            {
                self.pattern_hits.fetch_add(1, Ordering::Relaxed);
                let result = self.finish(request, verdict, &fingerprint, started).await;
                return Ok(result);
            }
        }

        if cancel.is_cancelled() {
            return Err(SpeedLayerError::Cancelled);
        }

        // Tier 3: optional ML scorer, trusted only above its floor.
        if let Some(ml) = &self.ml {
            match ml.score(request).await {
                Ok(Some(verdict))
                    if verdict.decision != Decision::Escalate
                        && verdict.confidence >= self.config.ml_confidence_floor =>
                {
                    self.ml_hits.fetch_add(1, Ordering::Relaxed);
                    let result = self.finish(request, verdict, &fingerprint, started).await;
                    return Ok(result);
                }
                Ok(_) => {}
                Err(e) => {
                    self.tier_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "ml tier failed; skipping");
                }
            }
        }

        // No tier was confident: escalate.
        self.escalate(request, &fingerprint, started, cancel).await
    }

    async fn finish(
        &self,
        request: &ValidationRequest,
        verdict: TierVerdict,
        fingerprint: &str,
        started: Instant,
    ) -> ValidationResult {
        let mut result = ValidationResult::new(
            &request.request_id,
            verdict.decision,
            verdict.confidence,
            verdict.reason,
        );
        result.risk_level = verdict.risk_level;
        result.security_concerns = verdict.security_concerns;
        result.processing_time_ms = elapsed_ms(started);
        self.cache.set(fingerprint, &result).await;
        debug!(
            request = %request.request_id,
            decision = ?result.decision,
            "pipeline settled request"
        );
        result
    }

    async fn escalate(
        &self,
        request: &ValidationRequest,
        fingerprint: &str,
        started: Instant,
        cancel: CancellationToken,
    ) -> Result<ValidationResult, SpeedLayerError> {
        self.escalations.fetch_add(1, Ordering::Relaxed);

        let Some(escalator) = &self.escalator else {
            self.fail_closed.fetch_add(1, Ordering::Relaxed);
            let mut result = ValidationResult::new(
                &request.request_id,
                Decision::Blocked,
                Confidence::High,
                "validation pipeline unavailable",
            );
            result.expert_required = true;
            result.risk_level = RiskLevel::High;
            result.processing_time_ms = elapsed_ms(started);
            return Ok(result);
        };

        let capabilities = vec![required_capability(&request.tool_name).to_string()];
        let child = cancel.child_token();

        // The expert call runs in its own task so a ruling that lands while
        // the caller is giving up is still written to the cache.
        let handle = {
            let escalator = Arc::clone(escalator);
            let cache = Arc::clone(&self.cache);
            let request = request.clone();
            let fingerprint = fingerprint.to_string();
            let child = child.clone();
            tokio::spawn(async move {
                let outcome = escalator
                    .escalate(&request, RiskLevel::Medium, &capabilities, child)
                    .await;
                if let Ok(verdict) = &outcome {
                    let mut result = ValidationResult::new(
                        &request.request_id,
                        verdict.decision,
                        verdict.confidence,
                        verdict.reason.clone(),
                    );
                    result.expert_required = true;
                    cache.set(&fingerprint, &result).await;
                }
                outcome
            })
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                child.cancel();
                return Err(SpeedLayerError::Cancelled);
            }
            joined = handle => joined,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.tier_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "escalation task failed");
                Err(EscalationError::Internal(e.to_string()))
            }
        };

        let mut result = match outcome {
            Ok(verdict) => ValidationResult::new(
                &request.request_id,
                verdict.decision,
                verdict.confidence,
                verdict.reason,
            ),
            Err(EscalationError::Cancelled) => return Err(SpeedLayerError::Cancelled),
            Err(e) => {
                // Fail closed; these results are deliberately not cached so a
                // recovered expert pool gets a fresh chance.
                self.fail_closed.fetch_add(1, Ordering::Relaxed);
                ValidationResult::new(
                    &request.request_id,
                    Decision::Blocked,
                    Confidence::High,
                    e.to_string(),
                )
            }
        };
        result.expert_required = true;
        result.cache_layer = CacheLayer::None;
        result.processing_time_ms = elapsed_ms(started);
        Ok(result)
    }

    /// Counters from the underlying tiered cache.
    pub fn cache_stats(&self) -> lighthouse_cache::CacheStats {
        self.cache.stats()
    }

    /// Snapshot of the pipeline counters.
    pub fn metrics(&self) -> SpeedLayerMetrics {
        SpeedLayerMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            policy_hits: self.policy_hits.load(Ordering::Relaxed),
            pattern_hits: self.pattern_hits.load(Ordering::Relaxed),
            ml_hits: self.ml_hits.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            tier_errors: self.tier_errors.load(Ordering::Relaxed),
            fail_closed: self.fail_closed.load(Ordering::Relaxed),
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use lighthouse_cache::{LocalCacheConfig, TieredCache};
    use lighthouse_types::AgentId;
    use serde_json::json;
    use std::time::Duration;

    fn cache() -> Arc<TieredCache> {
        Arc::new(TieredCache::new(
            LocalCacheConfig::default(),
            None,
            Duration::from_secs(60),
            Duration::from_millis(50),
        ))
    }

    fn dispatcher(escalator: Option<Arc<dyn ExpertEscalator>>) -> SpeedLayerDispatcher {
        SpeedLayerDispatcher::new(cache(), None, escalator, SpeedLayerConfig::default())
    }

    fn request(tool: &str, input: serde_json::Value) -> ValidationRequest {
        ValidationRequest::new(tool, input, AgentId::new("alice").unwrap(), "s1")
    }

    struct ApprovingEscalator;

    #[async_trait]
    impl ExpertEscalator for ApprovingEscalator {
        async fn escalate(
            &self,
            request: &ValidationRequest,
            _risk_level: RiskLevel,
            _capabilities: &[String],
            _cancel: CancellationToken,
        ) -> Result<ExpertVerdict, EscalationError> {
            Ok(ExpertVerdict {
                decision: Decision::Approved,
                confidence: Confidence::High,
                reason: format!("expert approved {}", request.tool_name),
                expert_ids: vec!["expert-1".to_string()],
            })
        }
    }

    struct TimingOutEscalator;

    #[async_trait]
    impl ExpertEscalator for TimingOutEscalator {
        async fn escalate(
            &self,
            _request: &ValidationRequest,
            _risk_level: RiskLevel,
            _capabilities: &[String],
            _cancel: CancellationToken,
        ) -> Result<ExpertVerdict, EscalationError> {
            Err(EscalationError::Timeout)
        }
    }

    #[tokio::test]
    async fn safe_read_is_approved_then_cached() {
        let dispatcher = dispatcher(None);
        let request = request("Read", json!({"file_path": "/tmp/x"}));

        let first = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.decision, Decision::Approved);
        assert!(!first.cache_hit);

        let second = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.cache_layer, CacheLayer::Local);
        assert_eq!(second.decision, Decision::Approved);
    }

    #[tokio::test]
    async fn destructive_command_short_circuits_at_policy() {
        let dispatcher = dispatcher(None);
        let request = request("Bash", json!({"command": "rm -rf /"}));
        let result = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Blocked);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(!result.expert_required);
        assert_eq!(dispatcher.metrics().policy_hits, 1);
    }

    #[tokio::test]
    async fn unknown_command_escalates_and_expert_result_is_cached() {
        let dispatcher = dispatcher(Some(Arc::new(ApprovingEscalator)));
        let request = request("Bash", json!({"command": "sudo apt update"}));

        let result = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Approved);
        assert!(result.expert_required);
        assert_eq!(dispatcher.metrics().escalations, 1);

        // An equivalent request from a different agent of the same role hits
        // the cache.
        let other = ValidationRequest::new(
            "Bash",
            json!({"command": "sudo apt update"}),
            AgentId::new("bob").unwrap(),
            "s2",
        );
        let cached = dispatcher
            .validate(&other, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert!(cached.cache_hit);
        assert_eq!(cached.decision, Decision::Approved);
        assert_eq!(dispatcher.metrics().escalations, 1);
    }

    #[tokio::test]
    async fn expert_timeout_blocks_and_is_not_cached() {
        let dispatcher = dispatcher(Some(Arc::new(TimingOutEscalator)));
        let request = request("Bash", json!({"command": "sudo make install"}));

        let result = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Blocked);
        assert!(result.reason.contains("expert timeout"));

        // The timeout verdict was not cached: a retry escalates again.
        let retry = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert!(!retry.cache_hit);
        assert_eq!(dispatcher.metrics().escalations, 2);
    }

    #[tokio::test]
    async fn no_escalator_fails_closed() {
        let dispatcher = dispatcher(None);
        let request = request("Bash", json!({"command": "terraform destroy"}));
        let result = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Blocked);
        assert_eq!(result.reason, "validation pipeline unavailable");
        assert_eq!(dispatcher.metrics().fail_closed, 1);
    }

    struct FailingMl;

    #[async_trait]
    impl MlTier for FailingMl {
        async fn score(
            &self,
            _request: &ValidationRequest,
        ) -> anyhow::Result<Option<TierVerdict>> {
            anyhow::bail!("model unavailable")
        }
    }

    #[tokio::test]
    async fn failing_ml_tier_is_isolated_and_never_approves() {
        let dispatcher = SpeedLayerDispatcher::new(
            cache(),
            Some(Arc::new(FailingMl)),
            None,
            SpeedLayerConfig::default(),
        );
        let request = request("Bash", json!({"command": "terraform apply"}));
        let result = dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        // The broken tier is skipped and the pipeline fails closed.
        assert_eq!(result.decision, Decision::Blocked);
        assert_eq!(dispatcher.metrics().tier_errors, 1);
    }

    #[tokio::test]
    async fn cancellation_propagates() {
        let dispatcher = dispatcher(Some(Arc::new(ApprovingEscalator)));
        let request = request("Bash", json!({"command": "cargo publish"}));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dispatcher
            .validate(&request, AgentRole::Agent, cancel)
            .await
            .unwrap_err();
        assert_eq!(err, SpeedLayerError::Cancelled);
    }

    #[tokio::test]
    async fn fingerprints_differ_across_roles() {
        let dispatcher = dispatcher(Some(Arc::new(ApprovingEscalator)));
        let request = request("Bash", json!({"command": "sudo apt update"}));

        dispatcher
            .validate(&request, AgentRole::Agent, CancellationToken::new())
            .await
            .unwrap();
        // Same request under a different role escalates separately.
        let result = dispatcher
            .validate(&request, AgentRole::Expert, CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.cache_hit);
        assert_eq!(dispatcher.metrics().escalations, 2);
    }
}
