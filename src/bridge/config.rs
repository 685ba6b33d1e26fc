use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{ModelError, Result};

/// Bridge and facade configuration
///
/// Controls the worker pool that runs blocking calls, the default
/// thread-affinity policy and how relation accessors are named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum number of blocking calls running at once
    pub max_workers: usize,

    /// Run bridged calls of one logical task on one dedicated thread
    pub thread_sensitive: bool,

    /// How long a call may wait for a free worker before failing
    pub acquire_timeout: Option<Duration>,

    /// Prefix that turns a relation name into its async accessor name
    pub accessor_prefix: String,

    /// Database alias used by `asave`/`adelete` when none is given
    pub default_alias: String,
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
            thread_sensitive: true,
            acquire_timeout: None,
            accessor_prefix: "a".to_string(),
            default_alias: "default".to_string(),
        }
    }

    /// Set maximum workers
    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Set the default thread-affinity policy
    pub fn thread_sensitive(mut self, sensitive: bool) -> Self {
        self.thread_sensitive = sensitive;
        self
    }

    /// Set the worker acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set the accessor prefix
    pub fn accessor_prefix(mut self, prefix: &str) -> Self {
        self.accessor_prefix = prefix.to_string();
        self
    }

    /// Set the default database alias
    pub fn default_alias(mut self, alias: &str) -> Self {
        self.default_alias = alias.to_string();
        self
    }

    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ModelError::Configuration(format!("Invalid bridge config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ModelError::Configuration("max_workers must be > 0".into()));
        }

        if self.accessor_prefix.is_empty() {
            return Err(ModelError::Configuration(
                "accessor_prefix cannot be empty".into(),
            ));
        }

        if self.default_alias.is_empty() {
            return Err(ModelError::Configuration(
                "default_alias cannot be empty".into(),
            ));
        }

        if self.acquire_timeout == Some(Duration::ZERO) {
            return Err(ModelError::Configuration(
                "acquire_timeout must be non-zero when set".into(),
            ));
        }

        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.max_workers >= 1);
        assert!(config.thread_sensitive);
        assert_eq!(config.accessor_prefix, "a");
        assert_eq!(config.default_alias, "default");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = BridgeConfig::new()
            .max_workers(4)
            .thread_sensitive(false)
            .acquire_timeout(Duration::from_millis(250))
            .accessor_prefix("async_")
            .default_alias("replica");

        assert_eq!(config.max_workers, 4);
        assert!(!config.thread_sensitive);
        assert_eq!(config.acquire_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.accessor_prefix, "async_");
        assert_eq!(config.default_alias, "replica");
    }

    #[test]
    fn test_validate() {
        assert!(BridgeConfig::new().max_workers(0).validate().is_err());
        assert!(BridgeConfig::new().accessor_prefix("").validate().is_err());
        assert!(BridgeConfig::new().default_alias("").validate().is_err());
        assert!(
            BridgeConfig::new()
                .acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config = BridgeConfig::from_json(r#"{"max_workers": 3}"#).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.accessor_prefix, "a");

        assert!(BridgeConfig::from_json(r#"{"max_workers": 0}"#).is_err());
        assert!(BridgeConfig::from_json("not json").is_err());
    }
}
