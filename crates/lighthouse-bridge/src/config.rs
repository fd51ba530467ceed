//! Bridge configuration.
//!
//! Replaces the original's deep nested configuration objects with one flat,
//! enumerated struct validated at startup. A bad configuration is an
//! unrecoverable startup failure and maps to a non-zero exit code.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lighthouse_event_core::FsyncPolicy;
use lighthouse_types::Confidence;

/// Which storage driver backs the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    /// Append-only segmented log files.
    SegmentedLog,
    /// Single-file SQLite database in WAL mode.
    SqliteWal,
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Directory for event log segments and snapshots.
    pub data_dir: PathBuf,
    /// Whitelist of filesystem prefixes the store may write under; empty
    /// disables the check.
    pub allowed_base_dirs: Vec<PathBuf>,
    /// HMAC key for event signing and session tokens; at least 32 bytes.
    #[serde(with = "serde_bytes_hex")]
    pub auth_secret: Vec<u8>,
    /// Node identifier stamped onto event ids.
    pub node_id: String,
    /// Session validity window in seconds.
    pub session_timeout_s: u64,
    /// Cap on concurrently live sessions.
    pub max_concurrent_sessions: usize,
    /// Local cache entry cap.
    pub local_cache_max_entries: usize,
    /// Local cache byte cap.
    pub local_cache_max_bytes: usize,
    /// Accesses within a minute that pin a cache entry as hot.
    pub hot_entry_threshold: u32,
    /// Remote cache URL for the transport shell to dial; `None` runs
    /// local-only.
    pub remote_cache_url: Option<String>,
    /// TTL for remote cache entries in seconds.
    pub remote_cache_ttl_s: u64,
    /// Bound on any single remote cache operation in milliseconds.
    pub remote_cache_op_timeout_ms: u64,
    /// Expert per-call timeout in seconds.
    pub expert_timeout_s: u64,
    /// Default consensus size for escalations.
    pub expert_consensus_default: usize,
    /// Default elicitation timeout in seconds.
    pub elicitation_default_timeout_s: u64,
    /// Storage driver selection.
    pub storage_backend: StorageBackendKind,
    /// Durability policy for the store.
    pub fsync_policy: FsyncPolicy,
    /// Minimum confidence at which an ML verdict decides a request.
    pub ml_confidence_floor: Confidence,
}

impl BridgeConfig {
    /// A configuration with documented defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            allowed_base_dirs: Vec::new(),
            auth_secret: Vec::new(),
            node_id: "lighthouse-01".to_string(),
            session_timeout_s: 3600,
            max_concurrent_sessions: 1000,
            local_cache_max_entries: 10_000,
            local_cache_max_bytes: 64 * 1024 * 1024,
            hot_entry_threshold: 3,
            remote_cache_url: None,
            remote_cache_ttl_s: 300,
            remote_cache_op_timeout_ms: 100,
            expert_timeout_s: 30,
            expert_consensus_default: 1,
            elicitation_default_timeout_s: 30,
            storage_backend: StorageBackendKind::SegmentedLog,
            fsync_policy: FsyncPolicy::PerWrite,
            ml_confidence_floor: Confidence::High,
        }
    }

    /// Validate the configuration; failures are unrecoverable at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_secret.len() < 32 {
            return Err("auth_secret must be at least 32 bytes".to_string());
        }
        if self.node_id.trim().is_empty() {
            return Err("node_id cannot be empty".to_string());
        }
        if !self.allowed_base_dirs.is_empty()
            && !self
                .allowed_base_dirs
                .iter()
                .any(|base| self.data_dir.starts_with(base))
        {
            return Err(format!(
                "data_dir {} is outside every allowed base directory",
                self.data_dir.display()
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err("max_concurrent_sessions must be positive".to_string());
        }
        if self.local_cache_max_entries == 0 || self.local_cache_max_bytes == 0 {
            return Err("local cache caps must be positive".to_string());
        }
        if self.expert_consensus_default == 0 {
            return Err("expert_consensus_default must be at least 1".to_string());
        }
        Ok(())
    }

    /// Session validity window.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_s)
    }

    /// Expert per-call deadline.
    pub fn expert_timeout(&self) -> Duration {
        Duration::from_secs(self.expert_timeout_s)
    }

    /// Default elicitation deadline.
    pub fn elicitation_default_timeout(&self) -> Duration {
        Duration::from_secs(self.elicitation_default_timeout_s)
    }

    /// Bound on a single remote cache operation.
    pub fn remote_cache_op_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_cache_op_timeout_ms)
    }
}

/// Serialize the secret as hex so config files never embed raw bytes.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> BridgeConfig {
        let mut config = BridgeConfig::with_data_dir("/tmp/lighthouse");
        config.auth_secret = b"0123456789abcdef0123456789abcdef".to_vec();
        config
    }

    #[test]
    fn default_config_validates_with_secret() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut config = valid();
        config.auth_secret = b"short".to_vec();
        assert!(config.validate().is_err());
    }

    #[test]
    fn data_dir_must_be_allowed() {
        let mut config = valid();
        config.allowed_base_dirs = vec![PathBuf::from("/var/lib/lighthouse")];
        assert!(config.validate().is_err());

        config.allowed_base_dirs = vec![PathBuf::from("/tmp")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = valid();
        let raw = serde_json::to_string(&config).unwrap();
        assert!(!raw.contains("0123456789abcdef0123456789abcdef"));
        let parsed: BridgeConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.auth_secret, config.auth_secret);
        assert_eq!(parsed.storage_backend, config.storage_backend);
    }
}
