//! Configuration file parsing (HOCON format).

use std::path::Path;

use crate::common::error::ConfigError;
use crate::config::types::Config;
use hocon::HoconLoader;

/// Load configuration from a HOCON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    HoconLoader::new()
        .load_file(path)
        .map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?
        .resolve()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

/// Load configuration from a HOCON string.
pub fn load_config_str(content: &str) -> Result<Config, ConfigError> {
    HoconLoader::new()
        .load_str(content)
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?
        .resolve()
        .map_err(|e| ConfigError::ValidationError {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
        general { data_dir = "/var/lib/guildlink" }
        discord {
            token = "abc"
            public_channel_ids = [100]
            officer_channel_ids = [200]
            command_prefix = "?"
        }
        minecraft {
            instances = [
                { name = "miner1", host = "127.0.0.1", port = 25565, username = "GuildBot" }
            ]
            limbo { idle_command = "/lobby", hold_timeout_secs = 90 }
            antispam { safe_score = 0.5 }
        }
        bridges = [
            { id = "main", minecraft_instance_names = ["miner1"], public_channel_ids = [100] }
        ]
        moderation {
            immune = ["GuildMaster"]
            kick { max = 3, expire_secs = 600 }
        }
    "#;

    #[test]
    fn test_load_config_str() {
        let config = load_config_str(SAMPLE).unwrap();
        assert_eq!(config.general.data_dir, "/var/lib/guildlink");
        assert_eq!(config.discord.token, "abc");
        assert_eq!(config.discord.command_prefix.as_deref(), Some("?"));
        assert_eq!(config.minecraft.instances.len(), 1);
        assert_eq!(config.minecraft.instances[0].port, 25565);
        assert_eq!(config.minecraft.limbo.idle_command, "/lobby");
        assert_eq!(config.minecraft.limbo.hold_timeout_secs, 90);
        assert_eq!(config.minecraft.limbo.acquire_timeout_secs, 30);
        assert_eq!(config.minecraft.antispam.safe_score, 0.5);
        assert!(config.minecraft.antispam.enabled);
        assert_eq!(config.bridges[0].id, "main");
        assert!(config.bridges[0].officer_channel_ids.is_empty());
        assert_eq!(config.moderation.kick.max, 3);
        assert_eq!(config.moderation.mute.max, 10);
    }

    #[test]
    fn test_defaults_for_minimal_config() {
        let config = load_config_str(r#"discord { token = "abc" }"#).unwrap();
        assert_eq!(config.general.data_dir, "data");
        assert!(config.discord.command_prefix.is_none());
        assert!(config.minecraft.instances.is_empty());
        assert!(config.bridges.is_empty());
        assert_eq!(config.minecraft.limbo.idle_command, "/limbo");
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::Builder::new().suffix(".conf").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.discord.officer_channel_ids, vec![200]);

        assert!(matches!(
            load_config("/nonexistent/guildlink.conf"),
            Err(ConfigError::IoError { .. })
        ));
    }
}
