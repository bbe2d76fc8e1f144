use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;

use crate::config::BridgeConfig;

pub const MQ_HOST: &str = "MQ_HOST";
pub const MQ_PORT: &str = "MQ_PORT";
pub const MQ_CHANNEL: &str = "MQ_CHANNEL";
pub const MQ_QUEUE_MANAGER: &str = "MQ_QUEUE_MANAGER";
pub const MQ_USERNAME: &str = "MQ_USERNAME";
pub const MQ_PASSWORD: &str = "MQ_PASSWORD";
pub const MQ_QUEUE: &str = "MQ_QUEUE";
pub const MQ_RECEIVE_TIMEOUT_MS: &str = "MQ_RECEIVE_TIMEOUT_MS";
pub const MQ_MESSAGE_COUNT: &str = "MQ_MESSAGE_COUNT";

/// Applies `MQ_*` variables from the process environment (and a `.env` file,
/// if present) on top of `config`.
pub fn apply_overrides(config: &mut BridgeConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_from(config, |name| env::var(name).ok())
}

pub fn apply_overrides_from<F>(config: &mut BridgeConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup(MQ_HOST) {
        config.connection.host = val;
    }
    if let Some(val) = lookup(MQ_PORT) {
        config.connection.port = val.parse().context(format!("{} must be a port number", MQ_PORT))?;
    }
    if let Some(val) = lookup(MQ_CHANNEL) {
        config.connection.channel = val;
    }
    if let Some(val) = lookup(MQ_QUEUE_MANAGER) {
        config.connection.queue_manager = val;
    }
    if let Some(val) = lookup(MQ_USERNAME) {
        config.connection.username = Some(val);
    }
    if let Some(val) = lookup(MQ_PASSWORD) {
        config.connection.password = Some(val);
    }
    if let Some(val) = lookup(MQ_QUEUE) {
        config.queue = val;
    }
    if let Some(val) = lookup(MQ_RECEIVE_TIMEOUT_MS) {
        config.receive_timeout_ms = val
            .parse()
            .context(format!("{} must be a number of milliseconds", MQ_RECEIVE_TIMEOUT_MS))?;
    }
    if let Some(val) = lookup(MQ_MESSAGE_COUNT) {
        config.message_count = val
            .parse()
            .context(format!("{} must be a positive integer", MQ_MESSAGE_COUNT))?;
    }
    Ok(())
}
