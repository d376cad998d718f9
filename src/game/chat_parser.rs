//! Turns raw game chat lines into typed bus events.
//!
//! Lines are matched against an ordered rule table; the first matching rule
//! decides the event. Anything the table does not know is ignored.

use std::borrow::Cow;

use fancy_regex::Regex;
use tracing::trace;

use crate::common::events::{ChatEvent, GuildGeneralEvent, GuildPlayerEvent, GuildPlayerKind};
use crate::common::{ChannelType, EventPayload};

/// Optional `[RANK] ` prefix in front of a player name.
const RANK: &str = r"(?:\[[^\]]+\] )?";

#[derive(Debug, Clone, Copy)]
enum RuleAction {
    Chat(ChannelType),
    Player(GuildPlayerKind),
    General,
}

/// Ordered; the first match wins.
const RULES: &[(&str, RuleAction)] = &[
    (
        r"^Guild > {rank}(?P<username>\w{1,16})(?: \[[^\]]+\])?: (?P<message>.+)$",
        RuleAction::Chat(ChannelType::Public),
    ),
    (
        r"^Officer > {rank}(?P<username>\w{1,16})(?: \[[^\]]+\])?: (?P<message>.+)$",
        RuleAction::Chat(ChannelType::Officer),
    ),
    (
        r"^Guild > (?P<username>\w{1,16}) joined\.$",
        RuleAction::Player(GuildPlayerKind::Online),
    ),
    (
        r"^Guild > (?P<username>\w{1,16}) left\.$",
        RuleAction::Player(GuildPlayerKind::Offline),
    ),
    (
        r"^{rank}(?P<username>\w{1,16}) joined the guild!$",
        RuleAction::Player(GuildPlayerKind::Join),
    ),
    (
        r"^{rank}(?P<username>\w{1,16}) left the guild!$",
        RuleAction::Player(GuildPlayerKind::Leave),
    ),
    (
        r"^{rank}(?P<username>\w{1,16}) was kicked from the guild by {rank}\w{1,16}!$",
        RuleAction::Player(GuildPlayerKind::Kick),
    ),
    (
        r"^{rank}(?P<username>\w{1,16}) was promoted from .+ to .+$",
        RuleAction::Player(GuildPlayerKind::Promote),
    ),
    (
        r"^{rank}(?P<username>\w{1,16}) was demoted from .+ to .+$",
        RuleAction::Player(GuildPlayerKind::Demote),
    ),
    (
        r"^{rank}\w{1,16} has muted {rank}(?P<username>\w{1,16}) for \w+$",
        RuleAction::Player(GuildPlayerKind::Mute),
    ),
    (
        r"^{rank}\w{1,16} has unmuted {rank}(?P<username>\w{1,16})$",
        RuleAction::Player(GuildPlayerKind::Unmute),
    ),
    (r"^The Guild has reached Level \d+!$", RuleAction::General),
    (r"^GUILD QUEST TIER \d+ COMPLETED!$", RuleAction::General),
    (r"^GUILD QUEST COMPLETED!$", RuleAction::General),
];

/// Remove `§x` formatting codes.
pub fn clean_line(line: &str) -> Cow<'_, str> {
    if !line.contains('§') {
        return Cow::Borrowed(line);
    }
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '§' {
            chars.next();
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

pub struct ChatParser {
    rules: Vec<(Regex, RuleAction)>,
    bot_username: String,
}

impl ChatParser {
    /// `bot_username` is the account the instance plays as; its own chat
    /// lines are dropped.
    pub fn new(bot_username: impl Into<String>) -> Result<Self, fancy_regex::Error> {
        let rules = RULES
            .iter()
            .map(|(pattern, action)| {
                Regex::new(&pattern.replace("{rank}", RANK)).map(|regex| (regex, *action))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            bot_username: bot_username.into(),
        })
    }

    pub fn parse(&self, raw: &str) -> Option<EventPayload> {
        let line = clean_line(raw);
        let line = line.trim();

        for (pattern, action) in &self.rules {
            let captures = match pattern.captures(line) {
                Ok(Some(captures)) => captures,
                Ok(None) => continue,
                Err(e) => {
                    trace!("Chat rule evaluation failed: {}", e);
                    continue;
                }
            };
            let username = captures
                .name("username")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            return match action {
                RuleAction::Chat(channel) => {
                    if username.eq_ignore_ascii_case(&self.bot_username) {
                        return None;
                    }
                    let message = captures
                        .name("message")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    Some(EventPayload::Chat(ChatEvent {
                        channel: *channel,
                        username,
                        user_id: None,
                        message,
                    }))
                }
                RuleAction::Player(kind) => Some(EventPayload::GuildPlayer(GuildPlayerEvent {
                    kind: *kind,
                    username,
                    message: line.to_string(),
                    raw_message: raw.to_string(),
                })),
                RuleAction::General => Some(EventPayload::GuildGeneral(GuildGeneralEvent {
                    message: line.to_string(),
                    raw_message: raw.to_string(),
                })),
            };
        }

        trace!("Unmatched chat line: {}", line);
        None
    }
}
