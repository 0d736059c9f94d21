//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (AGORA_HOST, AGORA_PORT, AGORA_DATABASE_URL)
//! - TOML configuration file

use agora_core::HubConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoints.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Chat history API.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Persistence.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// WebSocket endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for room connections.
    #[serde(default = "default_room_path")]
    pub room_path: String,

    /// Path for notification listeners.
    #[serde(default = "default_notifications_path")]
    pub notifications_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of each room's event mailbox.
    #[serde(default = "default_room_mailbox_capacity")]
    pub room_mailbox_capacity: usize,

    /// Capacity of each connection's outbound mailbox.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Maximum room name length in bytes.
    #[serde(default = "default_max_room_name_length")]
    pub max_room_name_length: usize,
}

/// Chat history API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Messages per history page when the client does not ask for a limit.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,

    /// Conversations returned by the recent chats listing.
    #[serde(default = "default_recent_chats_limit")]
    pub recent_chats_limit: u32,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("AGORA_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("AGORA_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8081)
}

fn default_database_url() -> String {
    std::env::var("AGORA_DATABASE_URL").unwrap_or_else(|_| "sqlite://agora.db?mode=rwc".to_string())
}

fn default_true() -> bool {
    true
}

fn default_room_path() -> String {
    "/room".to_string()
}

fn default_notifications_path() -> String {
    "/notifications".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_room_mailbox_capacity() -> usize {
    1024
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_max_room_name_length() -> usize {
    256
}

fn default_history_page_size() -> u32 {
    50
}

fn default_recent_chats_limit() -> u32 {
    20
}

fn default_max_connections() -> u32 {
    16
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            chat: ChatConfig::default(),
            database: DatabaseConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            room_path: default_room_path(),
            notifications_path: default_notifications_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            room_mailbox_capacity: default_room_mailbox_capacity(),
            outbound_capacity: default_outbound_capacity(),
            max_room_name_length: default_max_room_name_length(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_page_size: default_history_page_size(),
            recent_chats_limit: default_recent_chats_limit(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "agora.toml",
            "/etc/agora/agora.toml",
            "~/.config/agora/agora.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from the limits section.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            room_mailbox_capacity: self.limits.room_mailbox_capacity,
            outbound_capacity: self.limits.outbound_capacity,
            max_room_name_length: self.limits.max_room_name_length,
        }
    }
}
