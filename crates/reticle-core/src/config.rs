//! Engine configuration
//!
//! Settings are plain serde structs with defaults for every field, so a configuration file only
//! needs the keys it changes. YAML and JSON are both accepted; environment variables override
//! whatever was loaded.

use crate::error::{FailFast, LhsErrorHandler, ReteError, Result, SuppressFailures};
use crate::identity::IdentityComparer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub const ENV_NODE_SHARING: &str = "RETICLE_NODE_SHARING";
pub const ENV_LHS_ERRORS: &str = "RETICLE_LHS_ERRORS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Reuse structurally identical nodes across rules
    pub node_sharing: bool,
    pub identity: IdentityConfig,
    pub lhs_errors: LhsErrorMode,
    pub session: SessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_sharing: true,
            identity: IdentityConfig::Reference,
            lhs_errors: LhsErrorMode::FailFast,
            session: SessionConfig::default(),
        }
    }
}

/// How sessions decide that two payloads denote the same fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum IdentityConfig {
    Reference,
    Field { name: String },
}

/// What happens when a left-hand-side expression fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LhsErrorMode {
    FailFast,
    Suppress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Keep a log of every agenda notification
    pub record_agenda_events: bool,
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| ReteError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ReteError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReteError::configuration(format!("cannot read {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loading engine configuration");
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            other => Err(ReteError::configuration(format!(
                "unsupported configuration format '{}'",
                other.unwrap_or_default()
            ))),
        }
    }

    /// Apply `RETICLE_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_NODE_SHARING) {
            self.node_sharing = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(setting_error(ENV_NODE_SHARING, &value)),
            };
        }
        if let Some(value) = lookup(ENV_LHS_ERRORS) {
            self.lhs_errors = match value.to_ascii_lowercase().as_str() {
                "fail_fast" => LhsErrorMode::FailFast,
                "suppress" => LhsErrorMode::Suppress,
                _ => return Err(setting_error(ENV_LHS_ERRORS, &value)),
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if let IdentityConfig::Field { name } = &self.identity {
            if name.trim().is_empty() {
                return Err(ReteError::Configuration {
                    message: "identity field name must not be empty".to_string(),
                    setting: Some("identity.name".to_string()),
                });
            }
        }
        Ok(())
    }

    pub fn identity_comparer(&self) -> IdentityComparer {
        match &self.identity {
            IdentityConfig::Reference => IdentityComparer::default(),
            IdentityConfig::Field { name } => IdentityComparer::by_field(name.clone()),
        }
    }

    pub fn error_handler(&self) -> Box<dyn LhsErrorHandler> {
        match self.lhs_errors {
            LhsErrorMode::FailFast => Box::new(FailFast),
            LhsErrorMode::Suppress => Box::new(SuppressFailures),
        }
    }
}

fn setting_error(setting: &str, value: &str) -> ReteError {
    ReteError::Configuration { message: format!("invalid value '{value}'"), setting: Some(setting.to_string()) }
}
