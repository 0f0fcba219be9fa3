//! Server configuration.
//!
//! Layering: compiled defaults, then an optional JSON file, then `HUDDLE_*`
//! environment variables. The binary applies CLI flags on top.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// What to do when a connection arrives for an identity that is already live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Newcomer takes over; the old connection is closed without a leave event.
    #[default]
    Evict,
    /// Newcomer is closed before it is registered.
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Figment(Box::new(e))
    }
}

/// Configuration for the chat server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8002`, `0` for auto-assign).
    pub port: u16,
    /// Outbound frames buffered per connection before it counts as failed.
    pub send_queue_capacity: usize,
    /// Ping interval in seconds; 0 disables pings.
    pub heartbeat_interval_secs: u64,
    /// Close a session that has been silent this long; 0 disables.
    pub idle_timeout_secs: u64,
    /// Max inbound websocket message size in bytes.
    pub max_message_size: usize,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8002,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            max_message_size: 64 * 1024,
            duplicate_policy: DuplicatePolicy::Evict,
        }
    }
}

impl ServerConfig {
    /// Load from defaults, an optional JSON file and `HUDDLE_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        let config: Self = figment.merge(Env::prefixed("HUDDLE_")).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "send_queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_message_size must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_secs > 0
            && self.idle_timeout_secs > 0
            && self.idle_timeout_secs <= self.heartbeat_interval_secs
        {
            return Err(ConfigError::InvalidValue(format!(
                "idle_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.idle_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
