//! Delivery of bus events to Discord channels.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeHandler, BridgeResolver};
use crate::common::events::{
    BroadcastEvent, ChatEvent, CommandEvent, CommandFeedbackEvent, GuildGeneralEvent,
    GuildPlayerEvent, InstanceStatusEvent, PunishmentEvent,
};
use crate::common::{ChannelType, EventContext, InstanceType};
use crate::discord::api::PlatformApi;
use crate::moderation::PunishmentType;

/// Escape Discord markdown in text coming from the game.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '_' | '~' | '`' | '|' | '>' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct DiscordBridge {
    api: Arc<dyn PlatformApi>,
    resolver: Arc<BridgeResolver>,
    /// Channels used while no bridge is configured.
    legacy_public: Vec<u64>,
    legacy_officer: Vec<u64>,
}

impl DiscordBridge {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        resolver: Arc<BridgeResolver>,
        legacy_public: Vec<u64>,
        legacy_officer: Vec<u64>,
    ) -> Self {
        Self {
            api,
            resolver,
            legacy_public,
            legacy_officer,
        }
    }

    /// Channels of `channel` type an event from `ctx` fans out to.
    fn channels(&self, ctx: &EventContext, channel: ChannelType) -> Vec<u64> {
        let bridge_id = ctx.bridge_id.as_deref();
        let multi = self.resolver.is_multi_bridge_enabled();
        match channel {
            ChannelType::Public if multi => self.resolver.public_channels_for(bridge_id),
            ChannelType::Officer if multi => self.resolver.officer_channels_for(bridge_id),
            ChannelType::Public => self.legacy_public.clone(),
            ChannelType::Officer => self.legacy_officer.clone(),
            ChannelType::Private => Vec::new(),
        }
    }

    /// Send `content` to every channel, failing if any send failed.
    async fn deliver(&self, channels: &[u64], content: &str) -> Result<()> {
        if channels.is_empty() {
            debug!("No Discord channel for: {}", content);
            return Ok(());
        }

        let mut failures = 0;
        let mut last_error = None;
        for &channel_id in channels {
            if let Err(e) = self.api.send_message(channel_id, content).await {
                warn!(channel_id, "Failed to send to Discord: {:#}", e);
                failures += 1;
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e.context(format!("{failures} of {} sends failed", channels.len()))),
            None => Ok(()),
        }
    }
}

/// Log the name of every configured channel; unreachable ones are reported.
pub async fn verify_channels(api: &dyn PlatformApi, resolver: &BridgeResolver, legacy: &[u64]) {
    let mut channels: Vec<u64> = legacy.to_vec();
    for bridge in resolver.bridges() {
        channels.extend(bridge.public_channel_ids);
        channels.extend(bridge.officer_channel_ids);
    }
    channels.sort_unstable();
    channels.dedup();

    for channel_id in channels {
        match api.channel_name(channel_id).await {
            Ok(Some(name)) => info!(channel_id, "Using Discord channel #{}", name),
            Ok(None) => warn!(channel_id, "Configured channel is not a guild text channel"),
            Err(e) => warn!(channel_id, "Cannot access configured channel: {:#}", e),
        }
    }
}

#[async_trait]
impl BridgeHandler for DiscordBridge {
    async fn on_chat(&self, ctx: &EventContext, event: &ChatEvent) -> Result<()> {
        // Discord chat is already visible in Discord.
        if ctx.instance_type == InstanceType::Discord {
            return Ok(());
        }
        let content = format!(
            "**{}**: {}",
            escape_markdown(&event.username),
            escape_markdown(&event.message)
        );
        self.deliver(&self.channels(ctx, event.channel), &content).await
    }

    async fn on_command(&self, ctx: &EventContext, event: &CommandEvent) -> Result<()> {
        if ctx.instance_type == InstanceType::Discord {
            return Ok(());
        }
        let content = format!(
            "**{}** ran `{}`: {}",
            escape_markdown(&event.username),
            event.command,
            event.response
        );
        self.deliver(&self.channels(ctx, event.channel), &content).await
    }

    async fn on_command_feedback(
        &self,
        ctx: &EventContext,
        event: &CommandFeedbackEvent,
    ) -> Result<()> {
        let content = format!(
            "`{}` by **{}**: {}",
            event.command,
            escape_markdown(&event.username),
            event.response
        );
        self.deliver(&self.channels(ctx, ChannelType::Officer), &content)
            .await
    }

    async fn on_guild_player(&self, ctx: &EventContext, event: &GuildPlayerEvent) -> Result<()> {
        let content = format!("_{}_", escape_markdown(&event.message));
        self.deliver(&self.channels(ctx, ChannelType::Public), &content)
            .await
    }

    async fn on_guild_general(
        &self,
        ctx: &EventContext,
        event: &GuildGeneralEvent,
    ) -> Result<()> {
        let content = format!("**{}**", escape_markdown(&event.message));
        self.deliver(&self.channels(ctx, ChannelType::Public), &content)
            .await
    }

    async fn on_instance_status(
        &self,
        ctx: &EventContext,
        event: &InstanceStatusEvent,
    ) -> Result<()> {
        if ctx.instance_type != InstanceType::Minecraft {
            return Ok(());
        }
        let content = format!(
            "`{}` is {} ({})",
            ctx.instance_name, event.status, event.message
        );
        self.deliver(&self.channels(ctx, ChannelType::Officer), &content)
            .await
    }

    async fn on_broadcast(&self, ctx: &EventContext, event: &BroadcastEvent) -> Result<()> {
        if ctx.instance_type == InstanceType::Discord {
            return Ok(());
        }
        let mut channels = Vec::new();
        for channel in &event.channels {
            for id in self.channels(ctx, *channel) {
                if !channels.contains(&id) {
                    channels.push(id);
                }
            }
        }
        self.deliver(&channels, &event.message).await
    }

    async fn on_punishment_add(&self, ctx: &EventContext, event: &PunishmentEvent) -> Result<()> {
        let record = &event.record;
        let verb = match record.kind {
            PunishmentType::Mute => "muted",
            PunishmentType::Ban => "banned",
        };
        let mut content = format!(
            "**{}** was {} until <t:{}:f>",
            escape_markdown(&record.identifiers.join(", ")),
            verb,
            record.till.timestamp()
        );
        if let Some(actor) = &event.actor {
            content.push_str(&format!(" by **{}**", escape_markdown(actor)));
        }
        if !record.reason.is_empty() {
            content.push_str(&format!(": {}", escape_markdown(&record.reason)));
        }
        self.deliver(&self.channels(ctx, ChannelType::Officer), &content)
            .await
    }

    async fn on_punishment_forgive(
        &self,
        ctx: &EventContext,
        event: &PunishmentEvent,
    ) -> Result<()> {
        let verb = match event.record.kind {
            PunishmentType::Mute => "unmuted",
            PunishmentType::Ban => "unbanned",
        };
        let mut content = format!(
            "**{}** was {}",
            escape_markdown(&event.record.identifiers.join(", ")),
            verb
        );
        if let Some(actor) = &event.actor {
            content.push_str(&format!(" by **{}**", escape_markdown(actor)));
        }
        self.deliver(&self.channels(ctx, ChannelType::Officer), &content)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::common::events::InstanceStatus;
    use crate::config::BridgeConfig;
    use crate::moderation::PunishmentRecord;

    #[derive(Default)]
    struct RecordingApi {
        sent: Mutex<Vec<(u64, String)>>,
        looked_up: Mutex<Vec<u64>>,
        broken: Vec<u64>,
    }

    #[async_trait]
    impl PlatformApi for RecordingApi {
        async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
            if self.broken.contains(&channel_id) {
                bail!("missing access");
            }
            self.sent
                .lock()
                .unwrap()
                .push((channel_id, content.to_string()));
            Ok(())
        }

        async fn channel_name(&self, channel_id: u64) -> Result<Option<String>> {
            self.looked_up.lock().unwrap().push(channel_id);
            Ok(Some(format!("channel-{channel_id}")))
        }
    }

    fn two_bridges() -> Arc<BridgeResolver> {
        Arc::new(BridgeResolver::new(vec![
            BridgeConfig {
                id: "A".to_string(),
                minecraft_instance_names: vec!["miner1".to_string()],
                public_channel_ids: vec![10],
                officer_channel_ids: vec![11],
            },
            BridgeConfig {
                id: "B".to_string(),
                minecraft_instance_names: vec!["miner2".to_string()],
                public_channel_ids: vec![20],
                officer_channel_ids: vec![21],
            },
        ]))
    }

    fn game_ctx(name: &str, bridge: Option<&str>) -> EventContext {
        EventContext::new(name, InstanceType::Minecraft).with_bridge(bridge.map(String::from))
    }

    fn chat(channel: ChannelType, message: &str) -> ChatEvent {
        ChatEvent {
            channel,
            username: "Steve".to_string(),
            user_id: None,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_chat_goes_to_the_event_bridge_only() {
        let api = Arc::new(RecordingApi::default());
        let bridge = DiscordBridge::new(api.clone(), two_bridges(), vec![1], vec![2]);

        bridge
            .on_chat(&game_ctx("miner1", Some("A")), &chat(ChannelType::Public, "hi *all*"))
            .await
            .unwrap();
        bridge
            .on_chat(&game_ctx("miner2", Some("B")), &chat(ChannelType::Officer, "secret"))
            .await
            .unwrap();

        assert_eq!(
            *api.sent.lock().unwrap(),
            vec![
                (10, "**Steve**: hi \\*all\\*".to_string()),
                (21, "**Steve**: secret".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_global_events_reach_every_bridge() {
        let api = Arc::new(RecordingApi::default());
        let bridge = DiscordBridge::new(api.clone(), two_bridges(), vec![], vec![]);
        let ctx = EventContext::new("internal/main", InstanceType::Main);

        bridge
            .on_broadcast(
                &ctx,
                &BroadcastEvent {
                    channels: vec![ChannelType::Public, ChannelType::Officer],
                    message: "restarting".to_string(),
                },
            )
            .await
            .unwrap();

        let channels: Vec<u64> = api.sent.lock().unwrap().iter().map(|(c, _)| *c).collect();
        assert_eq!(channels, vec![10, 20, 11, 21]);
    }

    #[tokio::test]
    async fn test_legacy_mode_uses_configured_channels() {
        let api = Arc::new(RecordingApi::default());
        let resolver = Arc::new(BridgeResolver::new(Vec::new()));
        let bridge = DiscordBridge::new(api.clone(), resolver, vec![1], vec![2]);
        let ctx = game_ctx("miner1", None);

        bridge
            .on_instance_status(
                &ctx,
                &InstanceStatusEvent {
                    status: InstanceStatus::Connected,
                    message: "session established".to_string(),
                },
            )
            .await
            .unwrap();
        bridge
            .on_chat(&ctx, &chat(ChannelType::Private, "whisper"))
            .await
            .unwrap();

        assert_eq!(
            *api.sent.lock().unwrap(),
            vec![(2, "`miner1` is connected (session established)".to_string())]
        );
    }

    #[tokio::test]
    async fn test_discord_chat_is_not_echoed() {
        let api = Arc::new(RecordingApi::default());
        let bridge = DiscordBridge::new(api.clone(), two_bridges(), vec![], vec![]);
        let ctx = EventContext::new("discord", InstanceType::Discord).with_bridge(Some("A".into()));

        bridge
            .on_chat(&ctx, &chat(ChannelType::Public, "hello"))
            .await
            .unwrap();
        assert!(api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_still_delivers_and_reports() {
        let api = Arc::new(RecordingApi {
            broken: vec![10],
            ..Default::default()
        });
        let bridge = DiscordBridge::new(api.clone(), two_bridges(), vec![], vec![]);
        let ctx = game_ctx("miner1", None);

        let result = bridge
            .on_guild_general(
                &ctx,
                &GuildGeneralEvent {
                    message: "The guild has reached level 10!".to_string(),
                    raw_message: String::new(),
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(api.sent.lock().unwrap().len(), 1);
        assert_eq!(api.sent.lock().unwrap()[0].0, 20);
    }

    #[tokio::test]
    async fn test_punishments_go_to_officers() {
        let api = Arc::new(RecordingApi::default());
        let bridge = DiscordBridge::new(api.clone(), two_bridges(), vec![], vec![]);
        let ctx = EventContext::new("internal/moderation", InstanceType::Moderation)
            .with_bridge(Some("B".into()));
        let record = PunishmentRecord {
            kind: PunishmentType::Mute,
            identifiers: vec!["Steve".to_string()],
            till: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            reason: String::new(),
        };
        let event = PunishmentEvent {
            record,
            actor: Some("Alex".to_string()),
            at: Utc::now(),
        };

        bridge.on_punishment_add(&ctx, &event).await.unwrap();
        bridge.on_punishment_forgive(&ctx, &event).await.unwrap();

        let sent = api.sent.lock().unwrap();
        assert_eq!(sent[0].0, 21);
        assert!(sent[0].1.starts_with("**Steve** was muted until <t:"));
        assert!(sent[0].1.ends_with(" by **Alex**"));
        assert_eq!(sent[1], (21, "**Steve** was unmuted by **Alex**".to_string()));
    }

    #[tokio::test]
    async fn test_verify_channels_visits_each_once() {
        let api = Arc::new(RecordingApi::default());
        verify_channels(api.as_ref(), &two_bridges(), &[10, 2]).await;
        assert_eq!(*api.looked_up.lock().unwrap(), vec![2, 10, 11, 20, 21]);
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("a_b*c"), "a\\_b\\*c");
        assert_eq!(escape_markdown("plain"), "plain");
    }
}
