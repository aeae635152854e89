//! Configuration types for the murmur engine.
//!
//! This module defines the session settings: service endpoints, the model
//! and system prompt sent with every request, and the pacing of the reveal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::buffer::DEFAULT_CAPACITY;

/// Settings for a conversational session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Endpoint accepting `POST {model, messages}`.
    #[serde(default = "default_completion_url")]
    pub completion_url: String,

    /// Endpoint accepting `GET ?prompt=...` and returning a base64 image.
    #[serde(default = "default_image_url")]
    pub image_url: String,

    /// Model name forwarded to the completion service.
    #[serde(default = "default_model")]
    pub model: String,

    /// Instruction text sent as the leading system message.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Number of turns kept in the sliding window.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Delay between revealed characters, in milliseconds.
    #[serde(default = "default_reveal_interval_ms")]
    pub reveal_interval_ms: u64,

    /// Timeout in seconds for a completion request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout in seconds for an image fetch.
    #[serde(default = "default_image_timeout_secs")]
    pub image_timeout_secs: u64,

    /// Response text shown when a completion request fails.
    #[serde(default = "default_failure_placeholder")]
    pub failure_placeholder: String,

    /// Response text for a turn abandoned by a newer submission.
    #[serde(default = "default_cancelled_placeholder")]
    pub cancelled_placeholder: String,

    /// Whether the reveal asks the UI to follow the newest content.
    #[serde(default = "default_true")]
    pub auto_scroll: bool,

    /// Reject blank submissions instead of forwarding them.
    #[serde(default)]
    pub reject_empty_input: bool,

    /// Whether finalized responses trigger an image fetch.
    #[serde(default = "default_true")]
    pub image_enabled: bool,
}

fn default_completion_url() -> String {
    "http://localhost:8080/api".into()
}

fn default_image_url() -> String {
    "http://localhost:8080/api/get-image".into()
}

fn default_model() -> String {
    "gpt-4".into()
}

fn default_system_prompt() -> String {
    "You are a helpful, concise assistant.".into()
}

fn default_history_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_reveal_interval_ms() -> u64 {
    40
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_image_timeout_secs() -> u64 {
    120
}

fn default_failure_placeholder() -> String {
    "Request failed.".into()
}

fn default_cancelled_placeholder() -> String {
    "[cancelled]".into()
}

fn default_true() -> bool {
    true
}

impl SessionConfig {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Self = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults if it is missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        std::fs::write(path, content).map_err(ConfigError::Io)
    }

    /// Check the values a session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be at least 1".into(),
            ));
        }
        if self.reveal_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reveal_interval_ms must be greater than 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.completion_url.trim().is_empty() {
            return Err(ConfigError::Invalid("completion_url is empty".into()));
        }
        if self.image_enabled && self.image_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "image_url is empty but image_enabled is set".into(),
            ));
        }
        Ok(())
    }

    pub fn reveal_interval(&self) -> Duration {
        Duration::from_millis(self.reveal_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            completion_url: default_completion_url(),
            image_url: default_image_url(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            history_capacity: default_history_capacity(),
            reveal_interval_ms: default_reveal_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            image_timeout_secs: default_image_timeout_secs(),
            failure_placeholder: default_failure_placeholder(),
            cancelled_placeholder: default_cancelled_placeholder(),
            auto_scroll: true,
            reject_empty_input: false,
            image_enabled: true,
        }
    }
}

/// Errors that can occur when working with configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading or writing config.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing config JSON.
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),

    /// Error serializing config to JSON.
    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A value the session cannot run with.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
