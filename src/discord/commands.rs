//! Officer guild commands (!invite, !kick, !mute, ...).
//!
//! A command is checked against the issuer's heat, sent to the game through
//! the correlator and answered with whatever the game replied.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::bridge::BridgeResolver;
use crate::bus::{EventBus, InstanceIdentity};
use crate::common::events::CommandFeedbackEvent;
use crate::common::{BusEvent, EventPayload};
use crate::game::triggers::{ChatTriggerCorrelator, TriggerRequest, TriggerRuleSet, TriggerStatus};
use crate::moderation::{parse_duration, HeatResult, HeatType, Moderation};

pub const HELP_TEXT: &str = r#"**Officer Commands:**
• `invite <player>` - Invite a player to the guild
• `kick <player> <reason>` - Kick a member
• `mute <player> <duration>` - Mute a member (e.g. `30m`, `1d`)
• `unmute <player>` - Unmute a member
• `promote <player>` / `demote <player>` - Change a member's rank
• `accept <player>` - Accept a join request"#;

/// Commands forwarded to the game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuildCommand {
    Invite { username: String },
    Kick { username: String, reason: String },
    Mute { username: String, duration: String },
    Unmute { username: String },
    Promote { username: String },
    Demote { username: String },
    Accept { username: String },
}

/// What a message starting with the prefix turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Guild(GuildCommand),
    Help,
    /// Known command, bad arguments. Carries the usage line.
    Usage(&'static str),
}

fn is_valid_username(name: &str) -> bool {
    (1..=16).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse `content`; `None` when it is not one of our commands.
pub fn parse_command(prefix: &str, content: &str) -> Option<ParsedCommand> {
    let body = content.trim().strip_prefix(prefix)?;
    let mut parts = body.splitn(2, char::is_whitespace);
    let name = parts.next()?.to_lowercase();
    let args = parts.next().unwrap_or("").trim();

    let (username, rest) = match args.split_once(char::is_whitespace) {
        Some((username, rest)) => (username, rest.trim()),
        None => (args, ""),
    };
    let single = |usage: &'static str, build: fn(String) -> GuildCommand| {
        if is_valid_username(username) && rest.is_empty() {
            ParsedCommand::Guild(build(username.to_string()))
        } else {
            ParsedCommand::Usage(usage)
        }
    };

    let parsed = match name.as_str() {
        "help" => ParsedCommand::Help,
        "invite" => single("invite <player>", |username| GuildCommand::Invite { username }),
        "unmute" => single("unmute <player>", |username| GuildCommand::Unmute { username }),
        "promote" => single("promote <player>", |username| GuildCommand::Promote { username }),
        "demote" => single("demote <player>", |username| GuildCommand::Demote { username }),
        "accept" => single("accept <player>", |username| GuildCommand::Accept { username }),
        "kick" => {
            if is_valid_username(username) && !rest.is_empty() {
                ParsedCommand::Guild(GuildCommand::Kick {
                    username: username.to_string(),
                    reason: rest.to_string(),
                })
            } else {
                ParsedCommand::Usage("kick <player> <reason>")
            }
        }
        "mute" => {
            if is_valid_username(username) && parse_duration(rest).is_some() {
                ParsedCommand::Guild(GuildCommand::Mute {
                    username: username.to_string(),
                    duration: rest.to_lowercase(),
                })
            } else {
                ParsedCommand::Usage("mute <player> <duration>")
            }
        }
        _ => return None,
    };
    Some(parsed)
}

impl GuildCommand {
    pub fn username(&self) -> &str {
        match self {
            Self::Invite { username }
            | Self::Kick { username, .. }
            | Self::Mute { username, .. }
            | Self::Unmute { username }
            | Self::Promote { username }
            | Self::Demote { username }
            | Self::Accept { username } => username,
        }
    }

    /// Trigger rule that classifies the game's reply.
    pub fn rule_name(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "invite",
            Self::Kick { .. } => "kick",
            Self::Mute { .. } => "mute",
            Self::Unmute { .. } => "unmute",
            Self::Promote { .. } => "promote",
            Self::Demote { .. } => "demote",
            Self::Accept { .. } => "accept",
        }
    }

    /// Heat charged to the issuer. Unmuting and accepting are free.
    pub fn heat_type(&self) -> Option<HeatType> {
        match self {
            Self::Invite { .. } => Some(HeatType::Invite),
            Self::Kick { .. } => Some(HeatType::Kick),
            Self::Mute { .. } => Some(HeatType::Mute),
            Self::Promote { .. } => Some(HeatType::Promote),
            Self::Demote { .. } => Some(HeatType::Demote),
            Self::Unmute { .. } | Self::Accept { .. } => None,
        }
    }

    /// Line typed into the game.
    pub fn game_command(&self) -> String {
        match self {
            Self::Kick { username, reason } => format!("/g kick {username} {reason}"),
            Self::Mute { username, duration } => format!("/g mute {username} {duration}"),
            other => format!("/g {} {}", other.rule_name(), other.username()),
        }
    }
}

/// Who issued a command.
#[derive(Debug, Clone)]
pub struct Issuer {
    pub user_id: String,
    pub display_name: String,
}

/// Runs officer commands against the game.
pub struct CommandExecutor {
    bus: Arc<EventBus>,
    identity: InstanceIdentity,
    resolver: Arc<BridgeResolver>,
    correlator: ChatTriggerCorrelator,
    rules: TriggerRuleSet,
    moderation: Arc<Moderation>,
}

impl CommandExecutor {
    /// `identity` must already be registered on the bus.
    pub fn new(
        bus: Arc<EventBus>,
        identity: InstanceIdentity,
        resolver: Arc<BridgeResolver>,
        correlator: ChatTriggerCorrelator,
        rules: TriggerRuleSet,
        moderation: Arc<Moderation>,
    ) -> Self {
        Self {
            bus,
            identity,
            resolver,
            correlator,
            rules,
            moderation,
        }
    }

    /// Run `command` for `issuer` and return the reply text.
    pub async fn execute(
        &self,
        issuer: &Issuer,
        command: &GuildCommand,
        bridge_id: Option<String>,
    ) -> Result<String> {
        info!(
            issuer = %issuer.display_name,
            bridge = ?bridge_id,
            "Officer command: {}",
            command.game_command()
        );

        let mut warning = None;
        if let Some(kind) = command.heat_type() {
            let identifiers = [issuer.user_id.as_str(), issuer.display_name.as_str()];
            match self.moderation.heat().try_add(&identifiers, kind)? {
                HeatResult::Denied => {
                    debug!(issuer = %issuer.display_name, ?kind, "Command denied by heat");
                    return Ok(format!(
                        "You have reached your {} limit. Try again later.",
                        command.rule_name()
                    ));
                }
                HeatResult::Warn => {
                    warning = Some(format!(
                        "\nYou are close to your {} limit.",
                        command.rule_name()
                    ));
                }
                HeatResult::Allowed => {}
            }
        }

        let rule = self
            .rules
            .get(command.rule_name())
            .ok_or_else(|| anyhow!("No trigger rule named '{}'", command.rule_name()))?;

        let target_instances = bridge_id
            .as_deref()
            .map(|id| self.resolver.instances_for_bridge(id))
            .unwrap_or_default();

        let result = self
            .correlator
            .check_chat_triggers(
                &rule,
                TriggerRequest {
                    command: command.game_command(),
                    username: command.username().to_string(),
                    target_instances,
                    bridge_id: bridge_id.clone(),
                },
            )
            .await?;

        let lines: Vec<&str> = result.messages.iter().map(|m| m.content.as_str()).collect();
        let mut response = match result.status {
            TriggerStatus::Success => format!("Done: {}", lines.join(" / ")),
            TriggerStatus::Failed => format!("Failed: {}", lines.join(" / ")),
            TriggerStatus::Error => "The game did not answer in time.".to_string(),
        };

        let feedback = EventPayload::CommandFeedback(CommandFeedbackEvent {
            username: issuer.display_name.clone(),
            command: command.game_command(),
            response: response.clone(),
        });
        let context = self.identity.context().with_bridge(bridge_id);
        self.bus.publish(BusEvent::new(context, feedback))?;

        if let Some(warning) = warning {
            response.push_str(&warning);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::InstanceRegistry;
    use crate::common::events::MinecraftChatEvent;
    use crate::common::{EventKind, InstanceType};
    use crate::config::{HeatLimitConfig, ModerationConfig};
    use crate::moderation::{HeatTracker, PunishmentStore};

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("!", "!invite Steve"),
            Some(ParsedCommand::Guild(GuildCommand::Invite {
                username: "Steve".to_string()
            }))
        );
        assert_eq!(
            parse_command("!", "!KICK Steve spamming in chat"),
            Some(ParsedCommand::Guild(GuildCommand::Kick {
                username: "Steve".to_string(),
                reason: "spamming in chat".to_string(),
            }))
        );
        assert_eq!(
            parse_command("!", "!mute Steve 1H"),
            Some(ParsedCommand::Guild(GuildCommand::Mute {
                username: "Steve".to_string(),
                duration: "1h".to_string(),
            }))
        );
        assert_eq!(parse_command("!", "!help"), Some(ParsedCommand::Help));
        assert_eq!(parse_command("!", "!who"), None);
        assert_eq!(parse_command("!", "invite Steve"), None);
        assert_eq!(parse_command("?", "?accept Alex"), Some(ParsedCommand::Guild(GuildCommand::Accept {
            username: "Alex".to_string()
        })));
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert_eq!(parse_command("!", "!kick Steve"), Some(ParsedCommand::Usage("kick <player> <reason>")));
        assert_eq!(parse_command("!", "!mute Steve forever"), Some(ParsedCommand::Usage("mute <player> <duration>")));
        assert_eq!(
            parse_command("!", "!mute Steve 99999999999999d"),
            Some(ParsedCommand::Usage("mute <player> <duration>"))
        );
        assert_eq!(parse_command("!", "!invite"), Some(ParsedCommand::Usage("invite <player>")));
        assert_eq!(parse_command("!", "!invite not-a-name"), Some(ParsedCommand::Usage("invite <player>")));
        assert_eq!(parse_command("!", "!promote Steve now"), Some(ParsedCommand::Usage("promote <player>")));
    }

    #[test]
    fn test_game_command_and_heat() {
        let kick = GuildCommand::Kick {
            username: "Steve".to_string(),
            reason: "afk".to_string(),
        };
        assert_eq!(kick.game_command(), "/g kick Steve afk");
        assert_eq!(kick.heat_type(), Some(HeatType::Kick));

        let accept = GuildCommand::Accept {
            username: "Alex".to_string(),
        };
        assert_eq!(accept.game_command(), "/g accept Alex");
        assert_eq!(accept.heat_type(), None);
    }

    fn executor(kick_max: i64) -> (Arc<EventBus>, CommandExecutor) {
        let registry = Arc::new(InstanceRegistry::new());
        let discord = InstanceIdentity::new("discord", InstanceType::Discord);
        let moderation_id = InstanceIdentity::internal("moderation", InstanceType::Moderation);
        let correlator_id = InstanceIdentity::internal("correlator", InstanceType::Main);
        for identity in [&discord, &moderation_id, &correlator_id] {
            registry.register(identity.clone()).unwrap();
        }
        registry
            .register(InstanceIdentity::new("miner1", InstanceType::Minecraft))
            .unwrap();
        let bus = Arc::new(EventBus::new(registry));

        let mut config = ModerationConfig::default();
        config.kick = HeatLimitConfig {
            max: kick_max,
            expire_secs: 3600,
        };
        let moderation = Moderation::new(
            Arc::clone(&bus),
            moderation_id,
            HeatTracker::in_memory(config),
            PunishmentStore::in_memory(),
        )
        .unwrap();

        let executor = CommandExecutor::new(
            Arc::clone(&bus),
            discord,
            Arc::new(BridgeResolver::new(Vec::new())),
            ChatTriggerCorrelator::new(Arc::clone(&bus), correlator_id)
                .with_wait(Duration::from_secs(5)),
            TriggerRuleSet::builtin().unwrap(),
            Arc::new(moderation),
        );
        (bus, executor)
    }

    /// Answer every command sent to the game with `reply`.
    fn fake_game(bus: &Arc<EventBus>, reply: &'static str) {
        let (_, mut sends) = bus.subscribe_channel(&[EventKind::MinecraftSend]);
        let bus = Arc::clone(bus);
        let miner = InstanceIdentity::new("miner1", InstanceType::Minecraft);
        tokio::spawn(async move {
            while sends.recv().await.is_some() {
                bus.publish(BusEvent::new(
                    miner.context(),
                    EventPayload::MinecraftChat(MinecraftChatEvent {
                        message: reply.to_string(),
                    }),
                ))
                .unwrap();
            }
        });
    }

    fn officer() -> Issuer {
        Issuer {
            user_id: "1234".to_string(),
            display_name: "Alex".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_kick_publishes_feedback() {
        let (bus, executor) = executor(10);
        fake_game(&bus, "[VIP] Steve was kicked from the guild by [MVP] GuildBot!");
        let (_, mut feedback) = bus.subscribe_channel(&[EventKind::CommandFeedback]);

        let reply = executor
            .execute(
                &officer(),
                &GuildCommand::Kick {
                    username: "Steve".to_string(),
                    reason: "afk".to_string(),
                },
                None,
            )
            .await
            .unwrap();

        assert!(reply.starts_with("Done: "), "{reply}");
        let event = feedback.recv().await.unwrap();
        match &event.payload {
            EventPayload::CommandFeedback(e) => {
                assert_eq!(e.username, "Alex");
                assert_eq!(e.command, "/g kick Steve afk");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heat_denies_before_sending() {
        let (bus, executor) = executor(2);
        fake_game(&bus, "You cannot kick this player!");
        let (_, mut sends) = bus.subscribe_channel(&[EventKind::MinecraftSend]);
        let kick = GuildCommand::Kick {
            username: "Steve".to_string(),
            reason: "afk".to_string(),
        };

        let first = executor.execute(&officer(), &kick, None).await.unwrap();
        assert!(first.starts_with("Failed: "), "{first}");
        assert!(first.ends_with("close to your kick limit."), "{first}");
        assert!(sends.recv().await.is_some());

        let second = executor.execute(&officer(), &kick, None).await.unwrap();
        assert_eq!(second, "You have reached your kick limit. Try again later.");
        assert!(sends.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (_bus, executor) = executor(10);
        let reply = executor
            .execute(
                &officer(),
                &GuildCommand::Unmute {
                    username: "Steve".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply, "The game did not answer in time.");
    }
}
