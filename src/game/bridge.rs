//! Delivery of bus events to game instances.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bridge::{BridgeHandler, BridgeResolver};
use crate::common::events::{BroadcastEvent, ChatEvent, MinecraftSendEvent, ReconnectEvent};
use crate::common::{ChannelType, EventContext, InstanceType};
use crate::game::instance::MinecraftInstance;

/// Chat command used for each guild channel.
fn channel_command(channel: ChannelType) -> Option<&'static str> {
    match channel {
        ChannelType::Public => Some("/gc"),
        ChannelType::Officer => Some("/oc"),
        ChannelType::Private => None,
    }
}

pub struct MinecraftBridge {
    instances: Vec<Arc<MinecraftInstance>>,
    resolver: Arc<BridgeResolver>,
}

impl MinecraftBridge {
    pub fn new(instances: Vec<Arc<MinecraftInstance>>, resolver: Arc<BridgeResolver>) -> Self {
        Self {
            instances,
            resolver,
        }
    }

    /// Instances allowed to see an event from `ctx`.
    fn visible_to<'a>(
        &'a self,
        ctx: &'a EventContext,
    ) -> impl Iterator<Item = &'a Arc<MinecraftInstance>> + 'a {
        self.instances.iter().filter(move |instance| {
            self.resolver
                .should_process_event(ctx.bridge_id.as_deref(), instance.name())
        })
    }

    /// Visible instances, narrowed to `targets` unless it is empty.
    fn targeted<'a>(
        &'a self,
        ctx: &'a EventContext,
        targets: &'a [String],
    ) -> impl Iterator<Item = &'a Arc<MinecraftInstance>> + 'a {
        self.visible_to(ctx).filter(move |instance| {
            targets.is_empty()
                || targets
                    .iter()
                    .any(|target| target.eq_ignore_ascii_case(instance.name()))
        })
    }
}

#[async_trait]
impl BridgeHandler for MinecraftBridge {
    async fn on_chat(&self, ctx: &EventContext, event: &ChatEvent) -> Result<()> {
        // Game chat is already visible in game.
        if ctx.instance_type == InstanceType::Minecraft {
            return Ok(());
        }
        let Some(command) = channel_command(event.channel) else {
            return Ok(());
        };

        let line = format!("{}: {}", event.username, event.message);
        for instance in self.visible_to(ctx) {
            drop(instance.enqueue_chat(command, &line));
        }
        Ok(())
    }

    async fn on_broadcast(&self, ctx: &EventContext, event: &BroadcastEvent) -> Result<()> {
        if ctx.instance_type == InstanceType::Minecraft {
            return Ok(());
        }
        for instance in self.visible_to(ctx) {
            for command in event.channels.iter().copied().filter_map(channel_command) {
                drop(instance.enqueue_chat(command, &event.message));
            }
        }
        Ok(())
    }

    async fn on_minecraft_send(&self, ctx: &EventContext, event: &MinecraftSendEvent) -> Result<()> {
        let steps: Vec<String> = event
            .command
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        let mut delivered = 0;
        for instance in self.targeted(ctx, &event.target_instances) {
            delivered += 1;
            if steps.len() > 1 {
                // A scripted sequence must not interleave with the idle routine.
                let instance = Arc::clone(instance);
                let steps = steps.clone();
                let correlation_id = Some(ctx.event_id.clone());
                tokio::spawn(async move {
                    if let Err(e) = instance.run_exclusive(&steps, correlation_id).await {
                        warn!(instance = %instance.name(), "Exclusive command sequence dropped: {}", e);
                    }
                });
            } else if let Some(step) = steps.first() {
                drop(instance.enqueue(step.clone(), event.priority, Some(ctx.event_id.clone())));
            }
        }

        if delivered == 0 {
            debug!(targets = ?event.target_instances, "No game instance accepted the command");
        }
        Ok(())
    }

    async fn on_reconnect(&self, ctx: &EventContext, event: &ReconnectEvent) -> Result<()> {
        for instance in self.targeted(ctx, &event.target_instances) {
            instance.request_reconnect();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, InstanceRegistry};
    use crate::common::CommandPriority;
    use crate::config::{AntispamConfig, BridgeConfig, LimboConfig, MinecraftInstanceConfig};

    fn setup() -> (MinecraftBridge, Vec<Arc<MinecraftInstance>>) {
        let bus = Arc::new(EventBus::new(Arc::new(InstanceRegistry::new())));
        let resolver = Arc::new(BridgeResolver::new(vec![
            BridgeConfig {
                id: "A".to_string(),
                minecraft_instance_names: vec!["miner1".to_string()],
                public_channel_ids: vec![1],
                officer_channel_ids: vec![],
            },
            BridgeConfig {
                id: "B".to_string(),
                minecraft_instance_names: vec!["miner2".to_string()],
                public_channel_ids: vec![2],
                officer_channel_ids: vec![],
            },
        ]));
        let instances: Vec<_> = ["miner1", "miner2"]
            .into_iter()
            .map(|name| {
                MinecraftInstance::new(
                    MinecraftInstanceConfig {
                        name: name.to_string(),
                        host: "127.0.0.1".to_string(),
                        port: 25565,
                        username: "GuildBot".to_string(),
                    },
                    Arc::clone(&bus),
                    Arc::clone(&resolver),
                    &LimboConfig::default(),
                    AntispamConfig::default(),
                )
                .unwrap()
            })
            .collect();
        (MinecraftBridge::new(instances.clone(), resolver), instances)
    }

    fn discord_ctx(bridge: Option<&str>) -> EventContext {
        EventContext::new("discord", InstanceType::Discord).with_bridge(bridge.map(String::from))
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_respect_bridge_and_targets() {
        let (bridge, instances) = setup();
        let ctx = discord_ctx(Some("A"));
        let send = MinecraftSendEvent {
            target_instances: Vec::new(),
            priority: CommandPriority::High,
            command: "/g kick Steve".to_string(),
        };

        bridge.on_minecraft_send(&ctx, &send).await.unwrap();

        // Queued on the bridge's instance only; the cycle has not run yet.
        assert_eq!(instances[0].queue().len(), 1);
        assert_eq!(instances[1].queue().len(), 0);

        let global = discord_ctx(None);
        let targeted = MinecraftSendEvent {
            target_instances: vec!["MINER2".to_string()],
            ..send
        };
        let matched: Vec<_> = bridge
            .targeted(&global, &targeted.target_instances)
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(matched, vec!["miner2"]);

        let visible: Vec<_> = bridge
            .visible_to(&ctx)
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(visible, vec!["miner1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_game_chat_is_not_echoed_back() {
        let (bridge, instances) = setup();
        let ctx = EventContext::new("miner1", InstanceType::Minecraft).with_bridge(Some("A".into()));
        let chat = ChatEvent {
            channel: ChannelType::Public,
            username: "Steve".to_string(),
            user_id: None,
            message: "hi".to_string(),
        };

        bridge.on_chat(&ctx, &chat).await.unwrap();
        assert!(instances.iter().all(|i| i.queue().is_empty()));

        let from_discord = discord_ctx(Some("B"));
        bridge.on_chat(&from_discord, &chat).await.unwrap();
        assert_eq!(instances[0].queue().len(), 0);
        assert_eq!(instances[1].queue().len(), 1);
    }
}
