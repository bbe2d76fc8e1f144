// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "mq-bridge.json";

/// Where and how to reach the broker. Immutable once handed to a `ConnectionManager`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client channel name; sent to AMQP brokers as the connection name.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Queue manager; AMQP brokers treat it as the virtual host.
    #[serde(default = "default_queue_manager")]
    pub queue_manager: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_message_count")]
    pub message_count: u32,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_channel() -> String { "SYSTEM.DEF.SVRCONN".to_string() }
fn default_queue_manager() -> String { "/".to_string() }
fn default_queue() -> String { "DEV.QUEUE.1".to_string() }
fn default_receive_timeout_ms() -> u64 { 5000 }
fn default_message_count() -> u32 { 100 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            channel: default_channel(),
            queue_manager: default_queue_manager(),
            username: None,
            password: None,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue: default_queue(),
            receive_timeout_ms: default_receive_timeout_ms(),
            message_count: default_message_count(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        channel: impl Into<String>,
        queue_manager: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            channel: channel.into(),
            queue_manager: queue_manager.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// AMQP URI for this target. The queue manager becomes the virtual host.
    pub fn amqp_uri(&self) -> String {
        let username = self.username.as_deref().unwrap_or("guest");
        let password = self.password.as_deref().unwrap_or("guest");
        format!(
            "amqp://{}:{}@{}:{}/{}",
            username,
            password,
            self.host,
            self.port,
            encode_vhost(&self.queue_manager)
        )
    }
}

fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2f")
}

impl BridgeConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() {
            return Err(anyhow!("Configuration error: connection.host cannot be empty"));
        }
        if self.connection.port == 0 {
            return Err(anyhow!("Configuration error: connection.port must be non-zero"));
        }
        if self.connection.queue_manager.is_empty() {
            return Err(anyhow!("Configuration error: connection.queue_manager cannot be empty"));
        }
        if self.queue.trim().is_empty() {
            return Err(anyhow!("Configuration error: queue cannot be empty"));
        }
        Ok(())
    }
}

/// Looks for a configuration file: explicit path first, then the working
/// directory, then the home directory.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];
    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_file(path: &Path) -> Result<BridgeConfig> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON or fields of the wrong type")
}

/// Loads the file configuration (or defaults when none exists), applies
/// environment overrides and validates the result.
pub fn load_config(explicit: Option<&Path>) -> Result<BridgeConfig> {
    let mut config = match find_config_file(explicit) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config_file(&path)?
        }
        None => {
            debug!("No configuration file found, using defaults");
            BridgeConfig::default()
        }
    };

    crate::env::apply_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&BridgeConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
