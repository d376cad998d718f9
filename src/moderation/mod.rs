//! Moderation state: heat limits and the punishment ledger.
//!
//! ## Module Structure
//!
//! - `heat`: per-person rate limits on privileged actions
//! - `punishments`: mute/ban ledger
//!
//! [`Moderation`] owns both and keeps the bus informed: every punishment
//! applied or lifted, whether from Discord or observed in game chat, is
//! published as a `PunishmentAdd` / `PunishmentForgive` event.

pub mod heat;
pub mod punishments;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use fancy_regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::{EventBus, InstanceIdentity};
use crate::common::events::PunishmentEvent;
use crate::common::{BusEvent, EventKind, EventPayload};
use crate::game::chat_parser::clean_line;

pub use heat::{HeatResult, HeatTracker, HeatType};
pub use punishments::{PunishmentRecord, PunishmentStore, PunishmentType};

const MUTE_LINE: &str =
    r"^(?:\[[^\]]+\] )?(?P<actor>\w{1,16}) has muted (?:\[[^\]]+\] )?(?P<username>\w{1,16}) for (?P<duration>\w+)$";
const UNMUTE_LINE: &str =
    r"^(?:\[[^\]]+\] )?(?P<actor>\w{1,16}) has unmuted (?:\[[^\]]+\] )?(?P<username>\w{1,16})$";

/// Parse `30s`, `15m`, `2h` or `7d`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let unit = text.chars().last()?;
    let amount: i64 = text[..text.len() - unit.len_utf8()].parse().ok()?;
    if amount <= 0 {
        return None;
    }
    match unit.to_ascii_lowercase() {
        's' => Duration::try_seconds(amount),
        'm' => Duration::try_minutes(amount),
        'h' => Duration::try_hours(amount),
        'd' => Duration::try_days(amount),
        _ => None,
    }
}

pub struct Moderation {
    bus: Arc<EventBus>,
    identity: InstanceIdentity,
    heat: HeatTracker,
    punishments: PunishmentStore,
    mute_line: Regex,
    unmute_line: Regex,
}

impl Moderation {
    /// `identity` must already be registered on the bus.
    pub fn new(
        bus: Arc<EventBus>,
        identity: InstanceIdentity,
        heat: HeatTracker,
        punishments: PunishmentStore,
    ) -> Result<Self> {
        Ok(Self {
            bus,
            identity,
            heat,
            punishments,
            mute_line: Regex::new(MUTE_LINE)?,
            unmute_line: Regex::new(UNMUTE_LINE)?,
        })
    }

    pub fn heat(&self) -> &HeatTracker {
        &self.heat
    }

    pub fn punishments(&self) -> &PunishmentStore {
        &self.punishments
    }

    /// Record a punishment and announce it.
    pub fn punish(
        &self,
        record: PunishmentRecord,
        actor: Option<String>,
        bridge_id: Option<String>,
    ) -> Result<PunishmentRecord> {
        let stored = self.punishments.add(record)?;
        info!(kind = ?stored.kind, identifiers = ?stored.identifiers, actor = ?actor, "Punishment applied");
        self.announce(
            EventPayload::PunishmentAdd(PunishmentEvent {
                record: stored.clone(),
                actor,
                at: Utc::now(),
            }),
            bridge_id,
        )?;
        Ok(stored)
    }

    /// Lift a punishment and announce it, if there was one.
    pub fn forgive(
        &self,
        kind: PunishmentType,
        identifier: &str,
        actor: Option<String>,
        bridge_id: Option<String>,
    ) -> Result<Option<PunishmentRecord>> {
        let Some(lifted) = self.punishments.remove(kind, identifier)? else {
            debug!(?kind, identifier, "Nothing to forgive");
            return Ok(None);
        };
        info!(?kind, identifiers = ?lifted.identifiers, actor = ?actor, "Punishment lifted");
        self.announce(
            EventPayload::PunishmentForgive(PunishmentEvent {
                record: lifted.clone(),
                actor,
                at: Utc::now(),
            }),
            bridge_id,
        )?;
        Ok(Some(lifted))
    }

    /// Apply an in-game mute/unmute line. Returns whether the line was one.
    pub fn handle_game_line(
        &self,
        line: &str,
        bridge_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let line = clean_line(line);
        let line = line.trim();

        if let Ok(Some(captures)) = self.mute_line.captures(line) {
            let (Some(actor), Some(username), Some(duration)) = (
                captures.name("actor"),
                captures.name("username"),
                captures.name("duration"),
            ) else {
                return Ok(false);
            };
            let Some(till) = parse_duration(duration.as_str())
                .and_then(|length| now.checked_add_signed(length))
            else {
                debug!("Unrecognised mute duration in: {}", line);
                return Ok(false);
            };
            self.punish(
                PunishmentRecord {
                    kind: PunishmentType::Mute,
                    identifiers: vec![username.as_str().to_string()],
                    till,
                    reason: format!("muted in game by {}", actor.as_str()),
                },
                Some(actor.as_str().to_string()),
                bridge_id,
            )?;
            return Ok(true);
        }

        if let Ok(Some(captures)) = self.unmute_line.captures(line) {
            let (Some(actor), Some(username)) = (captures.name("actor"), captures.name("username"))
            else {
                return Ok(false);
            };
            self.forgive(
                PunishmentType::Mute,
                username.as_str(),
                Some(actor.as_str().to_string()),
                bridge_id,
            )?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Follow every game instance's chat for mute/unmute lines.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let (subscription, mut lines) = self.bus.subscribe_channel(&[EventKind::MinecraftChat]);
        let moderation = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = lines.recv().await {
                let EventPayload::MinecraftChat(chat) = &event.payload else {
                    continue;
                };
                if let Err(e) = moderation.handle_game_line(
                    &chat.message,
                    event.context.bridge_id.clone(),
                    Utc::now(),
                ) {
                    tracing::error!(
                        instance = %event.context.instance_name,
                        "Failed to apply moderation line: {:#}",
                        e
                    );
                }
            }
            moderation.bus.unsubscribe(subscription);
        })
    }

    fn announce(&self, payload: EventPayload, bridge_id: Option<String>) -> Result<()> {
        let context = self.identity.context().with_bridge(bridge_id);
        self.bus.publish(BusEvent::new(context, payload))?;
        Ok(())
    }
}
