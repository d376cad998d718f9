//! Canonical event types carried by the event bus.
//!
//! Every participant (Discord adapter, game instance, utility) publishes one
//! of these. An event is wrapped in an `Arc` when published and never mutated
//! afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::moderation::punishments::PunishmentRecord;

/// What kind of participant an instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    /// Process-level utilities (startup, shutdown, correlator).
    Main,
    Discord,
    Minecraft,
    Moderation,
    Plugin,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Main => "main",
            Self::Discord => "discord",
            Self::Minecraft => "minecraft",
            Self::Moderation => "moderation",
            Self::Plugin => "plugin",
        };
        f.write_str(name)
    }
}

/// Which guild channel a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Public,
    Officer,
    Private,
}

/// Discriminant of [`EventPayload`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Chat,
    Command,
    CommandFeedback,
    GuildPlayer,
    GuildGeneral,
    InstanceStatus,
    Broadcast,
    MinecraftChat,
    MinecraftSend,
    Reconnect,
    PunishmentAdd,
    PunishmentForgive,
}

impl EventKind {
    /// Kinds a platform bridge forwards between sides.
    ///
    /// Raw game lines (`MinecraftChat`) are deliberately absent: they are
    /// consumed by parsers and the correlator, never relayed as-is.
    pub const INTER_PLATFORM: [EventKind; 11] = [
        EventKind::Chat,
        EventKind::Command,
        EventKind::CommandFeedback,
        EventKind::GuildPlayer,
        EventKind::GuildGeneral,
        EventKind::InstanceStatus,
        EventKind::Broadcast,
        EventKind::MinecraftSend,
        EventKind::Reconnect,
        EventKind::PunishmentAdd,
        EventKind::PunishmentForgive,
    ];
}

/// Metadata every event carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Random id, doubles as the correlation id of commands the event causes.
    pub event_id: String,
    /// Name of the publishing instance.
    pub instance_name: String,
    /// Type of the publishing instance.
    pub instance_type: InstanceType,
    /// Whether the event originated in this process.
    pub local: bool,
    /// Bridge the event belongs to. `None` means global.
    pub bridge_id: Option<String>,
}

impl EventContext {
    /// Create a context for a locally originated event with no bridge.
    pub fn new(instance_name: impl Into<String>, instance_type: InstanceType) -> Self {
        Self {
            event_id: new_event_id(),
            instance_name: instance_name.into(),
            instance_type,
            local: true,
            bridge_id: None,
        }
    }

    /// Tag this context with a bridge id.
    pub fn with_bridge(mut self, bridge_id: Option<String>) -> Self {
        self.bridge_id = bridge_id;
        self
    }

    /// Derive a context for a follow-up event (fresh id, same origin and bridge).
    pub fn derive(&self) -> Self {
        Self {
            event_id: new_event_id(),
            ..self.clone()
        }
    }
}

/// Generate a random 128-bit hex event id.
pub fn new_event_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// A chat message from either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub channel: ChannelType,
    pub username: String,
    /// Platform-side user id when known (Discord snowflake).
    pub user_id: Option<String>,
    pub message: String,
}

/// A user command was executed and answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub channel: ChannelType,
    pub username: String,
    pub command: String,
    pub response: String,
}

/// Result of a command issued to a game instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFeedbackEvent {
    pub username: String,
    pub command: String,
    pub response: String,
}

/// Kind of membership change observed in the guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuildPlayerKind {
    Join,
    Leave,
    Kick,
    Promote,
    Demote,
    Mute,
    Unmute,
    Online,
    Offline,
}

impl fmt::Display for GuildPlayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Join => "joined the guild",
            Self::Leave => "left the guild",
            Self::Kick => "was kicked from the guild",
            Self::Promote => "was promoted",
            Self::Demote => "was demoted",
            Self::Mute => "was muted",
            Self::Unmute => "was unmuted",
            Self::Online => "is online",
            Self::Offline => "went offline",
        };
        f.write_str(text)
    }
}

/// A guild member related event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildPlayerEvent {
    pub kind: GuildPlayerKind,
    pub username: String,
    /// Pre-rendered line suitable for display.
    pub message: String,
    /// Raw game line that produced the event.
    pub raw_message: String,
}

/// A guild-wide event not tied to one member (level up, quest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildGeneralEvent {
    pub message: String,
    pub raw_message: String,
}

/// Connection lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Ended,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Ended => "ended",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatusEvent {
    pub status: InstanceStatus,
    pub message: String,
}

/// Announcement sent to the listed channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEvent {
    pub channels: Vec<ChannelType>,
    pub message: String,
}

/// One raw chat line received from a game instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinecraftChatEvent {
    pub message: String,
}

/// Explicit urgency requested by whoever issues a game command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPriority {
    /// Bypass the queue and send immediately.
    Instant,
    High,
    #[default]
    Default,
}

/// Request to send a command to game instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinecraftSendEvent {
    /// Target instance names. Empty means every game instance.
    pub target_instances: Vec<String>,
    pub priority: CommandPriority,
    pub command: String,
}

/// Ask game instances to drop and re-establish their session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectEvent {
    /// Target instance names. Empty means every game instance.
    pub target_instances: Vec<String>,
}

/// A mute/ban was applied or lifted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentEvent {
    pub record: PunishmentRecord,
    /// Who performed the action, for display.
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

/// Typed payload of a bus event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Chat(ChatEvent),
    Command(CommandEvent),
    CommandFeedback(CommandFeedbackEvent),
    GuildPlayer(GuildPlayerEvent),
    GuildGeneral(GuildGeneralEvent),
    InstanceStatus(InstanceStatusEvent),
    Broadcast(BroadcastEvent),
    MinecraftChat(MinecraftChatEvent),
    MinecraftSend(MinecraftSendEvent),
    Reconnect(ReconnectEvent),
    PunishmentAdd(PunishmentEvent),
    PunishmentForgive(PunishmentEvent),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Chat(_) => EventKind::Chat,
            Self::Command(_) => EventKind::Command,
            Self::CommandFeedback(_) => EventKind::CommandFeedback,
            Self::GuildPlayer(_) => EventKind::GuildPlayer,
            Self::GuildGeneral(_) => EventKind::GuildGeneral,
            Self::InstanceStatus(_) => EventKind::InstanceStatus,
            Self::Broadcast(_) => EventKind::Broadcast,
            Self::MinecraftChat(_) => EventKind::MinecraftChat,
            Self::MinecraftSend(_) => EventKind::MinecraftSend,
            Self::Reconnect(_) => EventKind::Reconnect,
            Self::PunishmentAdd(_) => EventKind::PunishmentAdd,
            Self::PunishmentForgive(_) => EventKind::PunishmentForgive,
        }
    }
}

/// An event as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub context: EventContext,
    pub payload: EventPayload,
}

impl BusEvent {
    pub fn new(context: EventContext, payload: EventPayload) -> Self {
        Self { context, payload }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_unique() {
        let a = new_event_id();
        let b = new_event_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_keeps_origin() {
        let ctx = EventContext::new("miner1", InstanceType::Minecraft)
            .with_bridge(Some("A".to_string()));
        let derived = ctx.derive();
        assert_eq!(derived.instance_name, "miner1");
        assert_eq!(derived.bridge_id.as_deref(), Some("A"));
        assert_ne!(derived.event_id, ctx.event_id);
    }

    #[test]
    fn test_payload_kind() {
        let payload = EventPayload::MinecraftChat(MinecraftChatEvent {
            message: "hello".to_string(),
        });
        assert_eq!(payload.kind(), EventKind::MinecraftChat);
        assert!(!EventKind::INTER_PLATFORM.contains(&EventKind::MinecraftChat));
    }
}
