//! Container configuration.
//!
//! Every field has a default, so an empty JSON object is a valid configuration:
//!
//! ```
//! use servlet_core::config::ContainerConfig;
//!
//! let config = ContainerConfig::from_json(r#"{ "async_timeout_ms": 5000 }"#).unwrap();
//! assert_eq!(config.async_timeout_ms, 5000);
//! assert!(config.async_supported);
//! assert_eq!(config.error_status_on_timeout, 500);
//! ```

use serde::Deserialize;
use thiserror::Error;

use crate::http::StatusCode;

/// Errors produced while loading a [`ContainerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown status code {0}")]
    UnknownStatus(u16),
}

/// Settings shared by every exchange a container admits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Whether exchanges may be suspended at all.
    pub async_supported: bool,
    /// Timeout armed on every suspension, in milliseconds. Zero or negative disables it.
    pub async_timeout_ms: i64,
    /// Status used for the error dispatch that follows an unhandled timeout.
    pub error_status_on_timeout: u16,
}

impl ContainerConfig {
    pub const DEFAULT_ASYNC_TIMEOUT_MS: i64 = 30_000;

    /// Parses a configuration from JSON, rejecting unknown fields and status codes.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        StatusCode::from_u16(self.error_status_on_timeout)
            .map(|_| ())
            .ok_or(ConfigError::UnknownStatus(self.error_status_on_timeout))
    }

    /// The status of the error dispatch issued after a timeout.
    pub fn timeout_error_status(&self) -> StatusCode {
        StatusCode::from_u16(self.error_status_on_timeout)
            .unwrap_or(StatusCode::InternalServerError)
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            async_supported: true,
            async_timeout_ms: Self::DEFAULT_ASYNC_TIMEOUT_MS,
            error_status_on_timeout: StatusCode::InternalServerError.as_u16(),
        }
    }
}
