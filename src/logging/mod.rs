//! Structured logging
//!
//! Installs a `tracing` subscriber with an `EnvFilter` and either a JSON or a
//! plain-text fmt layer. `RUST_LOG`, when set, overrides the configured level.

use crate::config::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Logging error types
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Initialization error: {0}")]
    InitError(String),
}

/// Build the filter for a config, preferring `RUST_LOG`.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidFilter {
        directive: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Initialize logging with the given configuration. Logs go to stderr so
/// command output on stdout stays clean.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), LoggingError> {
    if !config.enabled {
        return Ok(());
    }

    let env_filter = build_filter(config)?;

    match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| LoggingError::InitError(e.to_string()))?;

    info!(service = %config.service_name, format = ?config.format, "logging initialized");
    Ok(())
}
