//! Configuration for the coordinator client

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_url() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_app_name() -> String {
    "coordinator-client".to_string()
}

fn default_scope() -> String {
    "console".to_string()
}

fn default_expire_secs() -> u64 {
    3600
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

/// A spending allowance requested during authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allowance {
    /// Asset symbol, e.g. "usdc"
    pub asset: String,
    /// Decimal amount as a string (precision is the coordinator's concern)
    pub amount: String,
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Coordinator websocket URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Hex-encoded 32-byte Ed25519 seed for the holder identity.
    /// Connecting without a key fails with a signing error.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Application name sent in the auth request
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Optional application address the session is scoped to
    #[serde(default)]
    pub application: Option<String>,

    /// Requested session scope
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Requested session lifetime in seconds
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,

    /// Spending allowances requested for the session
    #[serde(default)]
    pub allowances: Vec<Allowance>,

    /// Default timeout for individual calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for each step of the authentication handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Base delay for exponential reconnect backoff
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Reconnect attempts before giving up with a terminal error event
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            private_key: None,
            app_name: default_app_name(),
            application: None,
            scope: default_scope(),
            expire_secs: default_expire_secs(),
            allowances: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "ws://localhost:8000/ws");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.private_key.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"url": "wss://clearing.example.com/ws"}"#).unwrap();
        assert_eq!(config.url, "wss://clearing.example.com/ws");
        assert_eq!(config.scope, "console");
        assert_eq!(config.reconnect_base_delay_ms, 500);
    }
}
