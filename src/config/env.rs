//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `GUILDLINK_CONFIG` - Path of the config file
//! - `GUILDLINK_DISCORD_TOKEN` - Discord bot token
//! - `GUILDLINK_DATA_DIR` - Directory of the persisted ledgers

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "GUILDLINK";

/// Apply environment variable overrides to a config.
///
/// This allows the bot token to be provided via the environment instead of
/// the config file.
pub fn apply_env_overrides(config: Config) -> Config {
    apply_overrides_from(config, |name| env::var(name).ok())
}

/// Same as [`apply_env_overrides`] with an explicit variable source.
pub fn apply_overrides_from<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = lookup(&format!("{}_DISCORD_TOKEN", ENV_PREFIX)) {
        config.discord.token = token;
    }
    if let Some(data_dir) = lookup(&format!("{}_DATA_DIR", ENV_PREFIX)) {
        if !data_dir.is_empty() {
            config.general.data_dir = data_dir;
        }
    }
    config
}

/// Get the config file path from environment or use default.
///
/// Checks `GUILDLINK_CONFIG` environment variable, otherwise returns "guildlink.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "guildlink.conf".to_string())
}
