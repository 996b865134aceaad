//! Typed configuration structures
//!
//! Provides strongly-typed access to configuration values with validation
//! and default values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Flow engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// CRM data used by the in-memory store
    #[serde(default)]
    pub store: StoreConfig,
}

impl AppConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError {
                path: "logging".to_string(),
                message: e,
            });
        }

        if self.engine.max_steps_per_pass == 0 {
            errors.push(ValidationError {
                path: "engine.maxStepsPerPass".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if let Some(flow) = &self.engine.default_flow {
            if flow.trim().is_empty() {
                errors.push(ValidationError {
                    path: "engine.defaultFlow".to_string(),
                    message: "must not be empty when set".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Validation error
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Install a subscriber at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Service name attached to the startup record
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Filter directive (error, warn, info, debug, trace or an EnvFilter
    /// string such as `wacrm::flows=debug`)
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: default_service_name(),
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.level.trim().is_empty() {
            return Err("level must not be empty".to_string());
        }
        Ok(())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format
    #[default]
    Text,
    /// JSON format (structured logging)
    Json,
}

/// Flow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Flow definition file or directory
    #[serde(default = "default_flows_path")]
    pub flows_path: PathBuf,

    /// Flow started for first-time contacts when no keyword matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_flow: Option<String>,

    /// Cycle guard: most steps run for a single inbound message
    #[serde(default = "default_max_steps")]
    pub max_steps_per_pass: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flows_path: default_flows_path(),
            default_flow: None,
            max_steps_per_pass: default_max_steps(),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// JSON5 file of `{ "app_label.Model": [records] }` loaded at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_path: Option<PathBuf>,

    /// Fail `query_model` on collections that were never seeded
    #[serde(default)]
    pub strict_collections: bool,
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "wacrm".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_flows_path() -> PathBuf {
    PathBuf::from("flows")
}

fn default_max_steps() -> usize {
    crate::flows::engine::DEFAULT_MAX_STEPS_PER_PASS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_steps_per_pass, 50);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_camel_case_fields() {
        let config: AppConfig = json5::from_str(
            r#"{
                engine: { flowsPath: "/srv/flows", defaultFlow: "welcome", maxStepsPerPass: 20 },
                logging: { level: "debug", format: "json" },
                store: { seedPath: "seed.json5", strictCollections: true },
            }"#,
        )
        .unwrap();
        assert_eq!(config.engine.flows_path, PathBuf::from("/srv/flows"));
        assert_eq!(config.engine.default_flow.as_deref(), Some("welcome"));
        assert_eq!(config.engine.max_steps_per_pass, 20);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.store.strict_collections);
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = AppConfig::default();
        config.engine.max_steps_per_pass = 0;
        config.engine.default_flow = Some("  ".into());
        config.logging.level = String::new();
        let errors = config.validate().unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["logging", "engine.maxStepsPerPass", "engine.defaultFlow"]);
    }
}
