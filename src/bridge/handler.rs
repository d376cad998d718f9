//! Capability interface implemented by every platform adapter.
//!
//! An adapter implements one callback per event kind it cares about; the
//! rest default to doing nothing. Adapters never touch the bus themselves:
//! the [`Bridge`](super::dispatcher::Bridge) wrapper subscribes on their
//! behalf and feeds them one event at a time.

use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

use crate::common::events::{
    BroadcastEvent, ChatEvent, CommandEvent, CommandFeedbackEvent, GuildGeneralEvent,
    GuildPlayerEvent, InstanceStatusEvent, MinecraftSendEvent, PunishmentEvent, ReconnectEvent,
};
use crate::common::{BusEvent, EventContext, EventKind, EventPayload};

#[async_trait]
pub trait BridgeHandler: Send + Sync + 'static {
    async fn on_chat(&self, _ctx: &EventContext, _event: &ChatEvent) -> Result<()> {
        Ok(())
    }

    async fn on_command(&self, _ctx: &EventContext, _event: &CommandEvent) -> Result<()> {
        Ok(())
    }

    async fn on_command_feedback(
        &self,
        _ctx: &EventContext,
        _event: &CommandFeedbackEvent,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_guild_player(&self, _ctx: &EventContext, _event: &GuildPlayerEvent) -> Result<()> {
        Ok(())
    }

    async fn on_guild_general(
        &self,
        _ctx: &EventContext,
        _event: &GuildGeneralEvent,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_instance_status(
        &self,
        _ctx: &EventContext,
        _event: &InstanceStatusEvent,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_broadcast(&self, _ctx: &EventContext, _event: &BroadcastEvent) -> Result<()> {
        Ok(())
    }

    async fn on_minecraft_send(
        &self,
        _ctx: &EventContext,
        _event: &MinecraftSendEvent,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_reconnect(&self, _ctx: &EventContext, _event: &ReconnectEvent) -> Result<()> {
        Ok(())
    }

    async fn on_punishment_add(&self, _ctx: &EventContext, _event: &PunishmentEvent) -> Result<()> {
        Ok(())
    }

    async fn on_punishment_forgive(
        &self,
        _ctx: &EventContext,
        _event: &PunishmentEvent,
    ) -> Result<()> {
        Ok(())
    }
}

/// Route one event to the matching callback.
pub async fn dispatch_event<H>(handler: &H, event: &BusEvent) -> Result<()>
where
    H: BridgeHandler + ?Sized,
{
    let ctx = &event.context;
    match &event.payload {
        EventPayload::Chat(e) => handler.on_chat(ctx, e).await,
        EventPayload::Command(e) => handler.on_command(ctx, e).await,
        EventPayload::CommandFeedback(e) => handler.on_command_feedback(ctx, e).await,
        EventPayload::GuildPlayer(e) => handler.on_guild_player(ctx, e).await,
        EventPayload::GuildGeneral(e) => handler.on_guild_general(ctx, e).await,
        EventPayload::InstanceStatus(e) => handler.on_instance_status(ctx, e).await,
        EventPayload::Broadcast(e) => handler.on_broadcast(ctx, e).await,
        EventPayload::MinecraftSend(e) => handler.on_minecraft_send(ctx, e).await,
        EventPayload::Reconnect(e) => handler.on_reconnect(ctx, e).await,
        EventPayload::PunishmentAdd(e) => handler.on_punishment_add(ctx, e).await,
        EventPayload::PunishmentForgive(e) => handler.on_punishment_forgive(ctx, e).await,
        // Raw lines are never relayed by bridges.
        EventPayload::MinecraftChat(_) => Ok(()),
    }
}

/// Receives failures of individual deliveries.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, bridge: &str, kind: EventKind, error: &anyhow::Error);
}

/// Default sink: log at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, bridge: &str, kind: EventKind, error: &anyhow::Error) {
        error!(bridge, ?kind, "Bridge delivery failed: {:#}", error);
    }
}
