//! Configuration type definitions.

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub discord: DiscordConfig,
    #[serde(default)]
    pub minecraft: MinecraftConfig,
    /// Static bridge definitions. Empty plus no dynamic bridges means legacy
    /// single-bridge mode.
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
    #[serde(default)]
    pub moderation: ModerationConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding the persisted JSON ledgers.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

/// Discord bot configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DiscordConfig {
    pub token: String,
    /// Public channels used when no bridge is configured.
    #[serde(default)]
    pub public_channel_ids: Vec<u64>,
    /// Officer channels used when no bridge is configured.
    #[serde(default)]
    pub officer_channel_ids: Vec<u64>,
    /// Roles allowed to run officer commands.
    #[serde(default)]
    pub officer_role_ids: Vec<u64>,
    /// Prefix for text commands (default "!").
    pub command_prefix: Option<String>,
}

/// Game-server side configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MinecraftConfig {
    #[serde(default)]
    pub instances: Vec<MinecraftInstanceConfig>,
    #[serde(default)]
    pub limbo: LimboConfig,
    #[serde(default)]
    pub antispam: AntispamConfig,
}

/// One game session, reached through a line-oriented relay.
#[derive(Debug, Clone, Deserialize)]
pub struct MinecraftInstanceConfig {
    /// Instance name on the bus.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// In-game username of the bot account (used for echo suppression).
    pub username: String,
}

/// Exclusive gate settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LimboConfig {
    /// Command run on world join when nobody holds the gate.
    #[serde(default = "default_idle_command")]
    pub idle_command: String,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_hold_timeout")]
    pub hold_timeout_secs: u64,
}

impl Default for LimboConfig {
    fn default() -> Self {
        Self {
            idle_command: default_idle_command(),
            acquire_timeout_secs: default_acquire_timeout(),
            hold_timeout_secs: default_hold_timeout(),
        }
    }
}

fn default_idle_command() -> String {
    "/limbo".to_string()
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_hold_timeout() -> u64 {
    60
}

/// Duplicate-message mutation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AntispamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Similarity above which a message is mutated.
    #[serde(default = "default_safe_score")]
    pub safe_score: f64,
    /// How many recent messages per destination are compared.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Maximum suffix characters appended to one message.
    #[serde(default = "default_max_additions")]
    pub max_additions: usize,
}

impl Default for AntispamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safe_score: default_safe_score(),
            history_size: default_history_size(),
            max_additions: default_max_additions(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_safe_score() -> f64 {
    0.8
}

fn default_history_size() -> usize {
    3
}

fn default_max_additions() -> usize {
    24
}

/// A guild-to-channel mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub id: String,
    #[serde(default)]
    pub minecraft_instance_names: Vec<String>,
    #[serde(default)]
    pub public_channel_ids: Vec<u64>,
    #[serde(default)]
    pub officer_channel_ids: Vec<u64>,
}

/// Moderation limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ModerationConfig {
    /// Identifiers (usernames, uuids, Discord ids) never limited.
    #[serde(default)]
    pub immune: Vec<String>,
    /// Minimum seconds between two warnings of the same type.
    #[serde(default = "default_warn_every")]
    pub warn_every_secs: u64,
    #[serde(default = "HeatLimitConfig::kick")]
    pub kick: HeatLimitConfig,
    #[serde(default = "HeatLimitConfig::mute")]
    pub mute: HeatLimitConfig,
    #[serde(default = "HeatLimitConfig::invite")]
    pub invite: HeatLimitConfig,
    #[serde(default = "HeatLimitConfig::rank_change")]
    pub promote: HeatLimitConfig,
    #[serde(default = "HeatLimitConfig::rank_change")]
    pub demote: HeatLimitConfig,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            immune: Vec::new(),
            warn_every_secs: default_warn_every(),
            kick: HeatLimitConfig::kick(),
            mute: HeatLimitConfig::mute(),
            invite: HeatLimitConfig::invite(),
            promote: HeatLimitConfig::rank_change(),
            demote: HeatLimitConfig::rank_change(),
        }
    }
}

fn default_warn_every() -> u64 {
    30 * 60
}

/// Sliding window limit of one action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HeatLimitConfig {
    /// Actions allowed within the window. Zero or less means unlimited.
    pub max: i64,
    /// Window length in seconds.
    pub expire_secs: u64,
}

impl HeatLimitConfig {
    const DAY: u64 = 24 * 60 * 60;

    pub fn kick() -> Self {
        Self {
            max: 5,
            expire_secs: Self::DAY,
        }
    }

    pub fn mute() -> Self {
        Self {
            max: 10,
            expire_secs: Self::DAY,
        }
    }

    pub fn invite() -> Self {
        Self {
            max: 20,
            expire_secs: Self::DAY,
        }
    }

    pub fn rank_change() -> Self {
        Self {
            max: 10,
            expire_secs: Self::DAY,
        }
    }
}
