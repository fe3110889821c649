//! Observability configuration shared by the relay binaries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl ObservabilityConfig {
    /// Load from a variable map. `LOG_FORMAT` accepts `json` or `text`.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ObservabilityError> {
        let json_logs = match vars.get(LOG_FORMAT_VAR).map(|s| s.to_ascii_lowercase()) {
            None => false,
            Some(format) if format == "json" => true,
            Some(format) if format == "text" => false,
            Some(other) => {
                return Err(ObservabilityError::InvalidValue(format!(
                    "{LOG_FORMAT_VAR} must be 'json' or 'text', got '{other}'"
                )))
            }
        };

        Ok(Self { json_logs })
    }

    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` wins when set; otherwise `default_directives` is used.
    pub fn init_tracing(&self, default_directives: &str) -> Result<(), ObservabilityError> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives.into());
        let registry = tracing_subscriber::registry().with(filter);

        let result = if self.json_logs {
            registry.with(fmt::layer().json()).try_init()
        } else {
            registry.with(fmt::layer()).try_init()
        };

        result.map_err(|e| ObservabilityError::Init(e.to_string()))
    }
}
