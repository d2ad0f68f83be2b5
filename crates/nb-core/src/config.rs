use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Longest prefix that still leaves room for `-xxxxxxxx` within the
/// 28 characters iptables allows for a chain name.
const MAX_CHAIN_PREFIX_LEN: usize = 19;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the service reads at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub blocker: BlockerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8086,
            log_level: "debug".to_string(),
            blocker: BlockerConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }
}

/// Settings of the rule-management engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockerConfig {
    pub chain_prefix: String,
    /// Also link the chain into OUTPUT
    pub hook_outbound: bool,
    pub iptables_path: String,
    /// Re-insert removed rules when an apply fails part way
    pub rollback_on_failure: bool,
    pub retry: RetryPolicy,
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            chain_prefix: "NETBLK".to_string(),
            hook_outbound: true,
            iptables_path: "iptables".to_string(),
            rollback_on_failure: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl BlockerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.chain_prefix;
        if prefix.is_empty() || prefix.len() > MAX_CHAIN_PREFIX_LEN {
            return Err(ConfigError::Invalid(format!(
                "chain_prefix must be 1-{} characters, got '{}'",
                MAX_CHAIN_PREFIX_LEN, prefix
            )));
        }
        if prefix.chars().any(|c| c.is_whitespace() || c == '!') {
            return Err(ConfigError::Invalid(format!(
                "chain_prefix '{}' contains invalid characters",
                prefix
            )));
        }
        if self.iptables_path.trim().is_empty() {
            return Err(ConfigError::Invalid("iptables_path is empty".to_string()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be a finite number of at least 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_elapsed_ms == 0 && self.retry.max_attempts.is_none() {
            return Err(ConfigError::Invalid(
                "retry needs max_elapsed_ms or max_attempts, otherwise it never gives up"
                    .to_string(),
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.randomization_factor) {
            return Err(ConfigError::Invalid(format!(
                "retry.randomization_factor must be within 0..=1, got {}",
                self.retry.randomization_factor
            )));
        }
        Ok(())
    }
}
