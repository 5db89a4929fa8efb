//! Engine configuration (tempo.toml)
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! lock_on_subscribe = true
//! replay_active_sources = true
//! refire_policy = "defer"
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// What a stream does when it is asked to resolve twice in one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefirePolicy {
    /// Log the defect and emit anyway
    #[default]
    Warn,
    /// Log the defect and hold the event until the next window
    Defer,
}

/// Runtime configuration shared by every node created from one scheduler
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Count a source's existing lock toward a new subscriber's lock state
    pub lock_on_subscribe: bool,
    /// Replay `start`/`end` when subscribing to or leaving a source mid-lifecycle
    pub replay_active_sources: bool,
    /// Handling of a second resolution within one window
    pub refire_policy: RefirePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_on_subscribe: true,
            replay_active_sources: true,
            refire_policy: RefirePolicy::Warn,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), ?config, "loaded engine config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.lock_on_subscribe);
        assert!(config.replay_active_sources);
        assert_eq!(config.refire_policy, RefirePolicy::Warn);
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            lock_on_subscribe = false
            refire_policy = "defer"
            "#,
        )
        .unwrap();

        assert!(!config.lock_on_subscribe);
        assert!(config.replay_active_sources);
        assert_eq!(config.refire_policy, RefirePolicy::Defer);
    }

    #[test]
    fn test_invalid_policy_is_parse_error() {
        let err = EngineConfig::from_toml_str(r#"refire_policy = "panic""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::load("/nonexistent/tempo.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
