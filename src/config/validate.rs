//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use std::collections::HashSet;

use crate::bus::registry::{validate_instance_name, INTERNAL_PREFIX};
use crate::common::error::ConfigError;
use crate::config::types::{Config, HeatLimitConfig};

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    // Validate Discord config
    if config.discord.token.is_empty() {
        errors.push("discord.token is required".to_string());
    }
    if config.discord.token == "YOUR_DISCORD_TOKEN_HERE" {
        errors.push("discord.token has not been configured (still using placeholder)".to_string());
    }
    if config.discord.command_prefix.as_deref() == Some("") {
        errors.push("discord.command_prefix must not be empty".to_string());
    }

    // Validate game instances
    if config.minecraft.instances.is_empty() {
        errors.push("minecraft.instances is empty - no game session configured".to_string());
    }
    let mut instance_names = HashSet::new();
    for (i, instance) in config.minecraft.instances.iter().enumerate() {
        if let Err(e) = validate_instance_name(&instance.name) {
            errors.push(format!("minecraft.instances[{}].name: {}", i, e));
        }
        if instance.name.starts_with(INTERNAL_PREFIX) {
            errors.push(format!(
                "minecraft.instances[{}].name must not start with '{}'",
                i, INTERNAL_PREFIX
            ));
        }
        if !instance_names.insert(instance.name.to_lowercase()) {
            errors.push(format!(
                "minecraft.instances[{}].name '{}' is used more than once",
                i, instance.name
            ));
        }
        if instance.host.is_empty() {
            errors.push(format!("minecraft.instances[{}].host is required", i));
        }
        if instance.port == 0 {
            errors.push(format!("minecraft.instances[{}].port must be non-zero", i));
        }
        let username_ok = (1..=16).contains(&instance.username.len())
            && instance
                .username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !username_ok {
            errors.push(format!(
                "minecraft.instances[{}].username '{}' is not a valid player name",
                i, instance.username
            ));
        }
    }

    // Validate limbo and antispam
    let limbo = &config.minecraft.limbo;
    if limbo.idle_command.trim().is_empty() {
        errors.push("minecraft.limbo.idle_command is required".to_string());
    }
    if limbo.acquire_timeout_secs == 0 {
        errors.push("minecraft.limbo.acquire_timeout_secs must be non-zero".to_string());
    }
    if limbo.hold_timeout_secs == 0 {
        errors.push("minecraft.limbo.hold_timeout_secs must be non-zero".to_string());
    }
    let antispam = &config.minecraft.antispam;
    if !(0.0..=1.0).contains(&antispam.safe_score) {
        errors.push(format!(
            "minecraft.antispam.safe_score must be between 0 and 1 (got {})",
            antispam.safe_score
        ));
    }
    if antispam.enabled && antispam.history_size == 0 {
        errors.push("minecraft.antispam.history_size must be non-zero".to_string());
    }

    // Validate bridges
    let mut bridge_ids = HashSet::new();
    for (i, bridge) in config.bridges.iter().enumerate() {
        if bridge.id.is_empty() {
            errors.push(format!("bridges[{}].id is required", i));
        } else if !bridge_ids.insert(bridge.id.as_str()) {
            errors.push(format!("bridges[{}].id '{}' is used more than once", i, bridge.id));
        }
        for name in &bridge.minecraft_instance_names {
            if !instance_names.contains(&name.to_lowercase()) {
                errors.push(format!(
                    "bridges[{}] references unknown instance '{}'",
                    i, name
                ));
            }
        }
        let channels = bridge
            .public_channel_ids
            .iter()
            .chain(&bridge.officer_channel_ids);
        if channels.clone().any(|id| *id == 0) {
            errors.push(format!("bridges[{}] channel ids must be non-zero", i));
        }
        if channels.count() == 0 {
            errors.push(format!("bridges[{}] has no Discord channel", i));
        }
    }

    // Validate moderation limits
    let limits: [(&str, &HeatLimitConfig); 5] = [
        ("kick", &config.moderation.kick),
        ("mute", &config.moderation.mute),
        ("invite", &config.moderation.invite),
        ("promote", &config.moderation.promote),
        ("demote", &config.moderation.demote),
    ];
    for (name, limit) in limits {
        if limit.max > 0 && limit.expire_secs == 0 {
            errors.push(format!("moderation.{}.expire_secs must be non-zero", name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::*;

    fn make_valid_config() -> Config {
        let mut config = Config::default();
        config.discord.token = "valid_token_here".to_string();
        config.minecraft.instances = vec![MinecraftInstanceConfig {
            name: "miner1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 25565,
            username: "GuildBot".to_string(),
        }];
        config.bridges = vec![BridgeConfig {
            id: "main".to_string(),
            minecraft_instance_names: vec!["Miner1".to_string()],
            public_channel_ids: vec![100],
            officer_channel_ids: vec![200],
        }];
        config
    }

    fn messages(config: &Config) -> String {
        match validate_config(config) {
            Err(ConfigError::ValidationError { message }) => message,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&make_valid_config()).is_ok());
    }

    #[test]
    fn test_placeholder_token() {
        let mut config = make_valid_config();
        config.discord.token = "YOUR_DISCORD_TOKEN_HERE".to_string();
        assert!(messages(&config).contains("placeholder"));
    }

    #[test]
    fn test_collects_every_problem() {
        let mut config = make_valid_config();
        config.discord.token.clear();
        config.minecraft.instances.push(MinecraftInstanceConfig {
            name: "MINER1".to_string(),
            host: String::new(),
            port: 0,
            username: "not a name".to_string(),
        });
        config.bridges[0].minecraft_instance_names.push("ghost".to_string());
        config.minecraft.antispam.safe_score = 1.5;

        let message = messages(&config);
        for expected in [
            "discord.token is required",
            "used more than once",
            "instances[1].host is required",
            "instances[1].port must be non-zero",
            "not a valid player name",
            "unknown instance 'ghost'",
            "safe_score must be between 0 and 1",
        ] {
            assert!(message.contains(expected), "missing '{expected}' in:\n{message}");
        }
    }

    #[test]
    fn test_bridge_and_limit_problems() {
        let mut config = make_valid_config();
        config.bridges.push(BridgeConfig {
            id: "main".to_string(),
            minecraft_instance_names: Vec::new(),
            public_channel_ids: Vec::new(),
            officer_channel_ids: Vec::new(),
        });
        config.moderation.kick = HeatLimitConfig {
            max: 3,
            expire_secs: 0,
        };

        let message = messages(&config);
        assert!(message.contains("bridges[1].id 'main' is used more than once"));
        assert!(message.contains("bridges[1] has no Discord channel"));
        assert!(message.contains("moderation.kick.expire_secs must be non-zero"));
    }

    #[test]
    fn test_internal_names_are_reserved() {
        let mut config = make_valid_config();
        config.minecraft.instances[0].name = "internal/miner".to_string();
        config.bridges.clear();
        assert!(messages(&config).contains("must not start with 'internal/'"));
    }
}
