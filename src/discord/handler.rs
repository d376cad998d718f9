//! Discord gateway event handling.
//!
//! Messages in a configured channel either run an officer command or are
//! published onto the bus as `Chat` events tagged with the channel's bridge.

use std::sync::Arc;

use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::*;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeResolver;
use crate::bus::{EventBus, InstanceIdentity};
use crate::common::events::ChatEvent;
use crate::common::{BusEvent, ChannelType, EventPayload};
use crate::config::DiscordConfig;
use crate::discord::commands::{parse_command, CommandExecutor, Issuer, ParsedCommand, HELP_TEXT};
use crate::moderation::{Moderation, PunishmentType};

pub const DEFAULT_COMMAND_PREFIX: &str = "!";

/// Officer commands need an officer role, or an officer channel when no
/// role is configured.
pub fn is_authorized(member_roles: &[u64], officer_roles: &[u64], channel: ChannelType) -> bool {
    if officer_roles.is_empty() {
        return channel == ChannelType::Officer;
    }
    member_roles.iter().any(|role| officer_roles.contains(role))
}

/// Message text plus attachment links.
pub fn message_text(content: &str, attachment_urls: &[String]) -> String {
    let mut text = content.trim().to_string();
    for url in attachment_urls {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(url);
    }
    text
}

pub struct DiscordHandler {
    bus: Arc<EventBus>,
    identity: InstanceIdentity,
    resolver: Arc<BridgeResolver>,
    moderation: Arc<Moderation>,
    commands: Arc<CommandExecutor>,
    public_channel_ids: Vec<u64>,
    officer_channel_ids: Vec<u64>,
    officer_role_ids: Vec<u64>,
    command_prefix: String,
    ready: Arc<Notify>,
}

impl DiscordHandler {
    /// `identity` must already be registered on the bus.
    pub fn new(
        config: &DiscordConfig,
        bus: Arc<EventBus>,
        identity: InstanceIdentity,
        resolver: Arc<BridgeResolver>,
        moderation: Arc<Moderation>,
        commands: Arc<CommandExecutor>,
    ) -> Self {
        Self {
            bus,
            identity,
            resolver,
            moderation,
            commands,
            public_channel_ids: config.public_channel_ids.clone(),
            officer_channel_ids: config.officer_channel_ids.clone(),
            officer_role_ids: config.officer_role_ids.clone(),
            command_prefix: config
                .command_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_COMMAND_PREFIX.to_string()),
            ready: Arc::new(Notify::new()),
        }
    }

    /// Notified every time the gateway session becomes ready.
    pub fn ready_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    /// Role of a channel and the bridge it belongs to.
    pub fn classify_channel(&self, channel_id: u64) -> Option<(ChannelType, Option<String>)> {
        if self.resolver.is_multi_bridge_enabled() {
            if let Some(bridge) = self.resolver.get_bridge_id_for_officer_channel(channel_id) {
                return Some((ChannelType::Officer, Some(bridge)));
            }
            if let Some(bridge) = self.resolver.get_bridge_id_for_public_channel(channel_id) {
                return Some((ChannelType::Public, Some(bridge)));
            }
            return None;
        }
        if self.officer_channel_ids.contains(&channel_id) {
            Some((ChannelType::Officer, None))
        } else if self.public_channel_ids.contains(&channel_id) {
            Some((ChannelType::Public, None))
        } else {
            None
        }
    }

    /// Whether a Discord user is muted under any of their identifiers.
    fn is_muted(&self, identifiers: &[&str]) -> bool {
        identifiers.iter().any(|id| {
            self.moderation
                .punishments()
                .find_active(PunishmentType::Mute, id)
                .is_some()
        })
    }

    /// Publish one Discord message as chat.
    pub fn publish_chat(
        &self,
        channel: ChannelType,
        bridge_id: Option<String>,
        issuer: &Issuer,
        text: String,
    ) {
        if self.is_muted(&[issuer.user_id.as_str(), issuer.display_name.as_str()]) {
            debug!(user = %issuer.display_name, "Dropping message from muted user");
            return;
        }

        let context = self.identity.context().with_bridge(bridge_id);
        let payload = EventPayload::Chat(ChatEvent {
            channel,
            username: issuer.display_name.clone(),
            user_id: Some(issuer.user_id.clone()),
            message: text,
        });
        if let Err(e) = self.bus.publish(BusEvent::new(context, payload)) {
            error!("Failed to publish Discord chat: {}", e);
        }
    }

    async fn run_command(
        &self,
        ctx: &Context,
        msg: &Message,
        parsed: ParsedCommand,
        channel: ChannelType,
        bridge_id: Option<String>,
        issuer: Issuer,
    ) {
        let roles: Vec<u64> = msg
            .member
            .as_ref()
            .map(|member| member.roles.iter().map(|role| role.get()).collect())
            .unwrap_or_default();
        if !is_authorized(&roles, &self.officer_role_ids, channel) {
            debug!(user = %issuer.display_name, "Officer command refused");
            msg.react(&ctx.http, '⛔').await.ok();
            return;
        }

        let reply = match parsed {
            ParsedCommand::Help => HELP_TEXT.to_string(),
            ParsedCommand::Usage(usage) => format!("Usage: `{}{}`", self.command_prefix, usage),
            ParsedCommand::Guild(command) => {
                msg.react(&ctx.http, '👀').await.ok();
                let commands = Arc::clone(&self.commands);
                // The correlator waits several seconds; keep the gateway free.
                let http = ctx.http.clone();
                let channel_id = msg.channel_id;
                tokio::spawn(async move {
                    let reply = match commands.execute(&issuer, &command, bridge_id).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!("Officer command failed: {:#}", e);
                            format!("Error: {e}")
                        }
                    };
                    if let Err(e) = channel_id.say(&http, reply).await {
                        warn!("Failed to reply to command: {}", e);
                    }
                });
                return;
            }
        };

        if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
            warn!("Failed to reply to command: {}", e);
        }
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        // Ignore bots, including ourselves
        if msg.author.bot {
            return;
        }

        // Only handle guild (server) messages
        if msg.guild_id.is_none() {
            return;
        }

        let Some((channel, bridge_id)) = self.classify_channel(msg.channel_id.get()) else {
            return;
        };

        let urls: Vec<String> = msg.attachments.iter().map(|a| a.url.clone()).collect();
        let text = message_text(&msg.content, &urls);
        if text.is_empty() {
            return;
        }

        let issuer = Issuer {
            user_id: msg.author.id.get().to_string(),
            display_name: msg
                .member
                .as_ref()
                .and_then(|m| m.nick.clone())
                .or_else(|| msg.author.global_name.clone())
                .unwrap_or_else(|| msg.author.name.clone()),
        };

        if let Some(parsed) = parse_command(&self.command_prefix, &text) {
            self.run_command(&ctx, &msg, parsed, channel, bridge_id, issuer)
                .await;
            return;
        }

        debug!(channel = ?channel, bridge = ?bridge_id, "Discord -> bus: {}", text);
        self.publish_chat(channel, bridge_id, &issuer, text);
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
        self.ready.notify_one();
    }
}
