//! Server configuration
//!
//! Every field has a default so the server starts with no configuration
//! at all. A JSON file may override any subset of them:
//!
//! ```json
//! { "chat_addr": "0.0.0.0:5000", "max_clients": 200 }
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The single fixed admin credential pair
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl Default for AdminCredentials {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin123".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Text-socket listener
    pub chat_addr: String,

    /// File-transfer relay listener
    pub transfer_addr: String,

    /// Admin listener (never capacity-gated)
    pub admin_addr: String,

    /// WebSocket listener
    pub ws_addr: String,

    pub max_clients: usize,

    /// Counted in characters
    pub max_username_length: usize,

    /// Counted in characters
    pub max_message_length: usize,

    /// Read buffer for relayed file streams
    pub file_buffer_size: usize,

    pub max_history_size: usize,

    pub max_file_size: u64,

    /// Largest accepted WebSocket frame payload
    pub max_frame_len: usize,

    /// Per-connection outbound queue length; a session whose queue fills is evicted
    pub outbound_capacity: usize,

    pub admin: AdminCredentials,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chat_addr: "127.0.0.1:5000".to_string(),
            transfer_addr: "127.0.0.1:5001".to_string(),
            admin_addr: "127.0.0.1:5002".to_string(),
            ws_addr: "127.0.0.1:8080".to_string(),
            max_clients: 50,
            max_username_length: 20,
            max_message_length: 1000,
            file_buffer_size: 8192,
            max_history_size: 100,
            max_file_size: 100 * 1024 * 1024, // 100 MiB
            max_frame_len: 1024 * 1024,       // 1 MiB
            outbound_capacity: 256,
            admin: AdminCredentials::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults with every listener on an ephemeral localhost port
    pub fn ephemeral() -> Self {
        Self {
            chat_addr: "127.0.0.1:0".to_string(),
            transfer_addr: "127.0.0.1:0".to_string(),
            admin_addr: "127.0.0.1:0".to_string(),
            ws_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max_clients", self.max_clients),
            ("max_username_length", self.max_username_length),
            ("max_message_length", self.max_message_length),
            ("file_buffer_size", self.file_buffer_size),
            ("max_frame_len", self.max_frame_len),
            ("outbound_capacity", self.outbound_capacity),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.admin.username.is_empty() || self.admin.password.is_empty() {
            return Err(ConfigError::Invalid(
                "admin credentials must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Longest accepted text-socket line in bytes
    ///
    /// Leaves room for a maximum-length message whose every character is
    /// four UTF-8 bytes and escaped, plus the other fields.
    pub fn max_line_len(&self) -> usize {
        self.max_message_length.saturating_mul(8).saturating_add(1024)
    }
}
