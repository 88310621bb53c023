//! Configuration management for Strata
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`STRATA_*` prefix, `__` between sections)
//! 2. strata.local.toml (gitignored, local overrides)
//! 3. strata.toml (git-tracked, node config)
//! 4. ~/.config/strata/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_types::{AccountAddress, NodeId};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Strata configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrataConfig {
    pub worker: WorkerConfig,
    pub shard: ShardSettings,
    pub producers: ProducerConfig,
}

/// Settings for the DBMS service of one worker node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Directory holding one subdirectory per hosted database.
    pub root_dir: PathBuf,
    /// Identity of this node, stamped on every response.
    pub node_id: String,
    /// Largest accepted distance between a request timestamp and now.
    pub max_req_time_gap_ms: u64,
    /// Deadline applied to each query.
    pub query_timeout_ms: u64,
    /// Reader connections per database.
    pub read_pool_size: usize,
    pub busy_timeout_ms: u64,
    /// Responses awaiting acknowledgement, per database.
    pub max_pending_acks: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(".strata/data"),
            node_id: "strata-node".to_string(),
            max_req_time_gap_ms: 60_000,
            query_timeout_ms: 30_000,
            read_pool_size: 4,
            busy_timeout_ms: 5_000,
            max_pending_acks: 10_000,
        }
    }
}

impl WorkerConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn max_req_time_gap(&self) -> Duration {
        Duration::from_millis(self.max_req_time_gap_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Sharding driver settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShardSettings {
    pub unresolved_target: UnresolvedTarget,
}

/// What to do with a statement on a sharded table that names no bucket.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedTarget {
    /// Address the empty baseline table.
    #[default]
    Baseline,
    /// Fail with an ambiguous-target error.
    Reject,
    /// Run once per known bucket and concatenate.
    FanOut,
}

/// Identities trusted to sign deployment operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProducerConfig {
    /// Hex-encoded account addresses.
    pub addresses: Vec<String>,
}

impl ProducerConfig {
    /// Parses the configured addresses.
    pub fn parse(&self) -> std::result::Result<Vec<AccountAddress>, ConfigError> {
        self.addresses
            .iter()
            .map(|a| {
                a.parse()
                    .map_err(|e| ConfigError::ValidationError(format!("block producer: {e}")))
            })
            .collect()
    }
}

impl StrataConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parses a single TOML document, without layering.
    pub fn from_toml_str(path: impl AsRef<Path>, content: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::ParseError {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::MergeError(e.to_string()))
    }

    /// Rejects settings the worker cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.worker.read_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "worker.read_pool_size must be at least 1".to_string(),
            ));
        }
        if self.worker.max_pending_acks == 0 {
            return Err(ConfigError::ValidationError(
                "worker.max_pending_acks must be at least 1".to_string(),
            ));
        }
        if self.worker.node_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "worker.node_id must not be empty".to_string(),
            ));
        }
        self.producers.parse()?;
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.worker.root_dir.is_relative() {
            self.worker.root_dir = base.join(&self.worker.root_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = StrataConfig::default();
        assert_eq!(config.worker.read_pool_size, 4);
        assert_eq!(config.worker.max_req_time_gap(), Duration::from_secs(60));
        assert_eq!(config.shard.unresolved_target, UnresolvedTarget::Baseline);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_resolution() {
        let mut config = StrataConfig::default();
        config.resolve_paths("/srv/strata");

        assert_eq!(config.worker.root_dir, PathBuf::from("/srv/strata/.strata/data"));
    }

    #[test_case("baseline", UnresolvedTarget::Baseline)]
    #[test_case("reject", UnresolvedTarget::Reject)]
    #[test_case("fan-out", UnresolvedTarget::FanOut)]
    fn test_unresolved_target_names(name: &str, expected: UnresolvedTarget) {
        let content = format!("[shard]\nunresolved_target = \"{name}\"\n");
        let config = StrataConfig::from_toml_str("strata.toml", &content).unwrap();
        assert_eq!(config.shard.unresolved_target, expected);
    }

    #[test]
    fn test_invalid_producer_address() {
        let content = "[producers]\naddresses = [\"not-hex\"]\n";
        let err = StrataConfig::from_toml_str("strata.toml", content).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_zero_read_pool_is_invalid() {
        let content = "[worker]\nread_pool_size = 0\n";
        assert!(StrataConfig::from_toml_str("strata.toml", content).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = StrataConfig::default();
        config.producers.addresses.push("ab".repeat(32));
        let text = config.to_toml_string().unwrap();
        let back = StrataConfig::from_toml_str("strata.toml", &text).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.producers.parse().unwrap().len(), 1);
    }
}
