//! Rule tiers of the validation pipeline.
//!
//! The policy tier is a compiled table of authoritative judgements on known
//! tool shapes. The pattern tier holds regex rules producing medium
//! confidence judgements. Both tiers evaluate blocking rules before
//! approving rules so a destructive command can never slip through on a
//! matching safe rule.

use once_cell::sync::Lazy;
use regex::Regex;

use lighthouse_types::{Confidence, Decision, RiskLevel, ValidationRequest};

/// A single tier's judgement on a request.
#[derive(Debug, Clone, PartialEq)]
pub struct TierVerdict {
    /// Proposed ruling.
    pub decision: Decision,
    /// Strength of the signal.
    pub confidence: Confidence,
    /// Why the tier ruled this way.
    pub reason: String,
    /// Severity the tier assigns to the request.
    pub risk_level: RiskLevel,
    /// Specific concerns to surface to the caller.
    pub security_concerns: Vec<String>,
}

impl TierVerdict {
    fn approved(reason: impl Into<String>, confidence: Confidence) -> Self {
        Self {
            decision: Decision::Approved,
            confidence,
            reason: reason.into(),
            risk_level: RiskLevel::Low,
            security_concerns: Vec::new(),
        }
    }

    fn blocked(
        reason: impl Into<String>,
        confidence: Confidence,
        risk_level: RiskLevel,
        concern: impl Into<String>,
    ) -> Self {
        Self {
            decision: Decision::Blocked,
            confidence,
            reason: reason.into(),
            risk_level,
            security_concerns: vec![concern.into()],
        }
    }
}

//─────────────────────────────
//  Policy tier
//─────────────────────────────

/// Tools that only ever read project state.
const SAFE_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS"];

/// Shell fragments that are destructive or privilege-escalating on sight.
const DANGEROUS_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf *",
    "sudo rm",
    "dd if=",
    "mkfs",
    "> /dev/",
    "shutdown",
    "reboot",
    ":(){",
];

/// Filesystem prefixes no agent may write under.
const PROTECTED_PREFIXES: &[&str] = &["/etc/", "/usr/", "/var/", "/boot/", "/sys/", "/proc/"];

/// Tools that modify files.
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit"];

/// Compiled table of authoritative safe/unsafe tool judgements.
#[derive(Debug, Default)]
pub struct PolicyTier;

impl PolicyTier {
    /// Evaluate the policy table; `None` falls through to the next tier.
    pub fn evaluate(&self, request: &ValidationRequest) -> Option<TierVerdict> {
        if request.tool_name == "Bash" {
            let command = request
                .tool_input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let lowered = command.to_lowercase();
            for fragment in DANGEROUS_COMMANDS {
                if lowered.contains(fragment) {
                    return Some(TierVerdict::blocked(
                        format!("destructive command pattern {fragment:?}"),
                        Confidence::High,
                        RiskLevel::Critical,
                        format!("command contains {fragment:?}"),
                    ));
                }
            }
            return None;
        }

        if WRITE_TOOLS.contains(&request.tool_name.as_str()) {
            let path = request
                .tool_input
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            for prefix in PROTECTED_PREFIXES {
                if path.starts_with(prefix) {
                    return Some(TierVerdict::blocked(
                        format!("write under protected prefix {prefix}"),
                        Confidence::High,
                        RiskLevel::High,
                        format!("attempted modification of {path}"),
                    ));
                }
            }
            return None;
        }

        if SAFE_TOOLS.contains(&request.tool_name.as_str()) {
            return Some(TierVerdict::approved(
                "known-safe read-only tool",
                Confidence::High,
            ));
        }

        None
    }
}

//─────────────────────────────
//  Pattern tier
//─────────────────────────────

static SAFE_SHELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(ls|pwd|echo|cat|head|tail|wc|whoami|date|git (status|diff|log))\b")
        .expect("static regex compiles")
});

static PROTECTED_REDIRECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r">\s*/(etc|usr|boot|sys|proc)/").expect("static regex compiles")
});

static PRIVILEGE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(sudo|doas|su)\b").expect("static regex compiles"));

/// Regex rules producing medium-confidence judgements.
#[derive(Debug, Default)]
pub struct PatternTier;

impl PatternTier {
    /// Evaluate the pattern rules; `None` falls through to the next tier.
    pub fn evaluate(&self, request: &ValidationRequest) -> Option<TierVerdict> {
        if request.tool_name != "Bash" {
            return None;
        }
        let command = request
            .tool_input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if PROTECTED_REDIRECT.is_match(command) {
            return Some(TierVerdict::blocked(
                "output redirected under a protected prefix",
                Confidence::Medium,
                RiskLevel::High,
                "redirect into system path",
            ));
        }

        if PRIVILEGE_PREFIX.is_match(command) {
            // Privilege escalation is not an automatic block, but it is never
            // approved without an expert ruling.
            return Some(TierVerdict {
                decision: Decision::Escalate,
                confidence: Confidence::Medium,
                reason: "privileged command requires expert review".to_string(),
                risk_level: RiskLevel::High,
                security_concerns: vec!["privilege escalation prefix".to_string()],
            });
        }

        if SAFE_SHELL.is_match(command) {
            return Some(TierVerdict::approved(
                "common safe shell builtin",
                Confidence::Medium,
            ));
        }

        None
    }
}

//─────────────────────────────
//  ML tier
//─────────────────────────────

/// Optional learned scorer consulted after the rule tiers.
///
/// Verdicts are only trusted at or above the dispatcher's configured
/// confidence floor. Errors are isolated: a failing scorer is skipped.
#[async_trait::async_trait]
pub trait MlTier: Send + Sync {
    /// Score a request; `None` abstains.
    async fn score(&self, request: &ValidationRequest) -> anyhow::Result<Option<TierVerdict>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lighthouse_types::AgentId;
    use serde_json::json;

    fn bash(command: &str) -> ValidationRequest {
        ValidationRequest::new(
            "Bash",
            json!({"command": command}),
            AgentId::new("alice").unwrap(),
            "s1",
        )
    }

    #[test]
    fn policy_blocks_destructive_commands() {
        let tier = PolicyTier;
        let verdict = tier.evaluate(&bash("rm -rf /")).unwrap();
        assert_eq!(verdict.decision, Decision::Blocked);
        assert_eq!(verdict.confidence, Confidence::High);
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn policy_approves_safe_tools() {
        let tier = PolicyTier;
        let request = ValidationRequest::new(
            "Read",
            json!({"file_path": "/tmp/x"}),
            AgentId::new("alice").unwrap(),
            "s1",
        );
        let verdict = tier.evaluate(&request).unwrap();
        assert_eq!(verdict.decision, Decision::Approved);
        assert_eq!(verdict.confidence, Confidence::High);
    }

    #[test]
    fn policy_blocks_system_path_writes() {
        let tier = PolicyTier;
        let request = ValidationRequest::new(
            "Write",
            json!({"file_path": "/etc/passwd", "content": "x"}),
            AgentId::new("alice").unwrap(),
            "s1",
        );
        let verdict = tier.evaluate(&request).unwrap();
        assert_eq!(verdict.decision, Decision::Blocked);
    }

    #[test]
    fn policy_abstains_on_ordinary_commands() {
        let tier = PolicyTier;
        assert!(tier.evaluate(&bash("cargo build")).is_none());
        let request = ValidationRequest::new(
            "Write",
            json!({"file_path": "/home/user/notes.txt"}),
            AgentId::new("alice").unwrap(),
            "s1",
        );
        assert!(tier.evaluate(&request).is_none());
    }

    #[test]
    fn pattern_approves_safe_builtins() {
        let tier = PatternTier;
        let verdict = tier.evaluate(&bash("ls -la /tmp")).unwrap();
        assert_eq!(verdict.decision, Decision::Approved);
        assert_eq!(verdict.confidence, Confidence::Medium);

        let verdict = tier.evaluate(&bash("git status")).unwrap();
        assert_eq!(verdict.decision, Decision::Approved);
    }

    #[test]
    fn pattern_escalates_privileged_commands() {
        let tier = PatternTier;
        let verdict = tier.evaluate(&bash("sudo apt update")).unwrap();
        assert_eq!(verdict.decision, Decision::Escalate);
    }

    #[test]
    fn pattern_blocks_protected_redirects() {
        let tier = PatternTier;
        let verdict = tier.evaluate(&bash("echo pwned > /etc/motd")).unwrap();
        assert_eq!(verdict.decision, Decision::Blocked);
    }

    #[test]
    fn pattern_abstains_on_unknown_commands() {
        let tier = PatternTier;
        assert!(tier.evaluate(&bash("cargo test --workspace")).is_none());
    }
}
