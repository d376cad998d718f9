//! Command/reply correlation over the raw chat stream.
//!
//! The game offers no request/response channel: the outcome of a command is
//! only visible as chat lines arriving afterwards. [`ChatTriggerCorrelator`]
//! sends the command, listens to `MinecraftChat` events for a bounded window
//! and classifies matching lines with a [`TriggerRule`].
//!
//! Rules live in one versioned table so upstream wording changes are edits
//! to data, not to the matching code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fancy_regex::{Captures, Regex};
use tracing::{debug, trace};

use crate::bus::{EventBus, InstanceIdentity};
use crate::common::error::IntegrityViolation;
use crate::common::events::MinecraftSendEvent;
use crate::common::{bounded, BusEvent, CommandPriority, EventKind, EventPayload, InstanceType};
use crate::game::chat_parser::clean_line;

/// Bumped whenever the builtin table changes.
pub const RULES_VERSION: u32 = 1;

/// Default listening window.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Optional `[RANK] ` prefix in front of a player name.
const RANK: &str = r"(?:\[[^\]]+\] )?";

/// `(name, success patterns, failure patterns)`. `{rank}` expands to [`RANK`].
const BUILTIN_RULES: &[(&str, &[&str], &[&str])] = &[
    (
        "invite",
        &[
            r"^You invited {rank}(?P<username>\w{1,16}) to your guild\. They have 5 minutes to accept\.$",
            r"^You sent an offline invite to {rank}(?P<username>\w{1,16})! They will have 5 minutes to join once they come online!$",
        ],
        &[
            r"^You cannot invite this player to your guild!$",
            r"^{rank}(?P<username>\w{1,16}) is already in (?:another|your) guild!$",
            r"^You've already invited {rank}(?P<username>\w{1,16}) to your guild! Wait for them to accept!$",
            r"^Your guild is full!$",
            r"^You do not have permission to invite players!$",
            r"^Can't find a player by the name of '(?P<username>\w{1,16})'$",
        ],
    ),
    (
        "kick",
        &[r"^{rank}(?P<username>\w{1,16}) was kicked from the guild by {rank}\w{1,16}!$"],
        &[
            r"^You cannot kick this player!$",
            r"^{rank}(?P<username>\w{1,16}) is not in your guild!$",
            r"^You do not have permission to kick people from the guild!$",
            r"^Can't find a player by the name of '(?P<username>\w{1,16})'$",
        ],
    ),
    (
        "promote",
        &[r"^{rank}(?P<username>\w{1,16}) was promoted from .+ to .+$"],
        &[
            r"^{rank}(?P<username>\w{1,16}) is already the highest rank you've created!$",
            r"^You can only promote up to your own rank!$",
            r"^{rank}(?P<username>\w{1,16}) is not in your guild!$",
            r"^Can't find a player by the name of '(?P<username>\w{1,16})'$",
        ],
    ),
    (
        "demote",
        &[r"^{rank}(?P<username>\w{1,16}) was demoted from .+ to .+$"],
        &[
            r"^{rank}(?P<username>\w{1,16}) is already the lowest rank you've created!$",
            r"^You can only demote up to your own rank!$",
            r"^{rank}(?P<username>\w{1,16}) is not in your guild!$",
            r"^Can't find a player by the name of '(?P<username>\w{1,16})'$",
        ],
    ),
    (
        "setrank",
        &[r"^{rank}(?P<username>\w{1,16}) was (?:promoted|demoted) from .+ to .+$"],
        &[
            r"^I couldn't find a rank by the name of '.+'!$",
            r"^{rank}(?P<username>\w{1,16}) is already that rank!$",
            r"^{rank}(?P<username>\w{1,16}) is not in your guild!$",
        ],
    ),
    (
        "mute",
        &[r"^{rank}\w{1,16} has muted {rank}(?P<username>\w{1,16}) for \w+$"],
        &[
            r"^You cannot mute a guild member with a higher guild rank!$",
            r"^You cannot mute someone for more than one month$",
            r"^You cannot mute someone for less than a minute$",
            r"^{rank}(?P<username>\w{1,16}) is not in your guild!$",
            r"^Can't find a player by the name of '(?P<username>\w{1,16})'$",
        ],
    ),
    (
        "unmute",
        &[r"^{rank}\w{1,16} has unmuted {rank}(?P<username>\w{1,16})$"],
        &[
            r"^{rank}(?P<username>\w{1,16}) is not muted!$",
            r"^{rank}(?P<username>\w{1,16}) is not in your guild!$",
        ],
    ),
    (
        "accept",
        &[r"^{rank}(?P<username>\w{1,16}) joined the guild!$"],
        &[
            r"^There are no pending requests from that player!$",
            r"^Your guild is full!$",
            r"^{rank}(?P<username>\w{1,16}) is already in another guild!$",
        ],
    ),
];

/// Success and failure patterns of one command.
pub struct TriggerRule {
    pub name: String,
    pub success: Vec<Regex>,
    pub failure: Vec<Regex>,
}

impl TriggerRule {
    pub fn new(
        name: impl Into<String>,
        success: &[&str],
        failure: &[&str],
    ) -> Result<Self, fancy_regex::Error> {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(&p.replace("{rank}", RANK)))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            name: name.into(),
            success: compile(success)?,
            failure: compile(failure)?,
        })
    }
}

/// Named rules, looked up by command.
pub struct TriggerRuleSet {
    version: u32,
    rules: HashMap<String, Arc<TriggerRule>>,
}

impl TriggerRuleSet {
    /// Compile the builtin table.
    pub fn builtin() -> Result<Self, fancy_regex::Error> {
        let mut rules = HashMap::new();
        for (name, success, failure) in BUILTIN_RULES {
            rules.insert(
                name.to_string(),
                Arc::new(TriggerRule::new(*name, success, failure)?),
            );
        }
        Ok(Self {
            version: RULES_VERSION,
            rules,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<Arc<TriggerRule>> {
        self.rules.get(name).cloned()
    }

    pub fn insert(&mut self, rule: TriggerRule) {
        self.rules.insert(rule.name.clone(), Arc::new(rule));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    /// At least one success line was seen.
    Success,
    /// Only failure lines were seen.
    Failed,
    /// Nothing relevant arrived in time. Outcome unknown.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMessage {
    pub instance_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTriggerResult {
    pub status: TriggerStatus,
    pub messages: Vec<TriggerMessage>,
}

/// One correlated command.
pub struct TriggerRequest {
    pub command: String,
    /// Player the command targets; captured names must equal it.
    pub username: String,
    /// Empty means every registered game instance.
    pub target_instances: Vec<String>,
    pub bridge_id: Option<String>,
}

/// Accumulates matches while listening.
struct Collector<'a> {
    rule: &'a TriggerRule,
    username: String,
    targets: Vec<String>,
    expected: usize,
    succeeded: HashSet<String>,
    failed: bool,
    messages: Vec<TriggerMessage>,
}

impl Collector<'_> {
    /// Feed one line. Returns `true` once every expected responder succeeded.
    fn observe(&mut self, instance_name: &str, line: &str) -> bool {
        if !self.targets.is_empty()
            && !self
                .targets
                .iter()
                .any(|t| t.eq_ignore_ascii_case(instance_name))
        {
            return false;
        }

        let line = clean_line(line);
        let line = line.trim();

        for pattern in &self.rule.success {
            match pattern.captures(line) {
                Ok(Some(captures)) if self.names_target(&captures) => {
                    self.record(instance_name, line);
                    self.succeeded.insert(instance_name.to_lowercase());
                    return self.succeeded.len() >= self.expected;
                }
                Ok(_) => {}
                Err(e) => trace!(rule = %self.rule.name, "Pattern evaluation failed: {}", e),
            }
        }

        if self.succeeded.is_empty() {
            for pattern in &self.rule.failure {
                if let Ok(Some(captures)) = pattern.captures(line) {
                    if self.names_target(&captures) {
                        self.record(instance_name, line);
                        self.failed = true;
                        break;
                    }
                }
            }
        }

        false
    }

    fn names_target(&self, captures: &Captures<'_>) -> bool {
        match captures.name("username").or_else(|| captures.get(1)) {
            Some(name) => name.as_str().eq_ignore_ascii_case(&self.username),
            None => true,
        }
    }

    fn record(&mut self, instance_name: &str, line: &str) {
        self.messages.push(TriggerMessage {
            instance_name: instance_name.to_string(),
            content: line.to_string(),
        });
    }

    fn finish(self) -> ChatTriggerResult {
        let status = if !self.succeeded.is_empty() {
            TriggerStatus::Success
        } else if self.failed {
            TriggerStatus::Failed
        } else {
            TriggerStatus::Error
        };
        ChatTriggerResult {
            status,
            messages: self.messages,
        }
    }
}

/// Issues game commands and waits for their chat-visible outcome.
pub struct ChatTriggerCorrelator {
    bus: Arc<EventBus>,
    identity: InstanceIdentity,
    wait: Duration,
}

impl ChatTriggerCorrelator {
    /// `identity` must already be registered on the bus.
    pub fn new(bus: Arc<EventBus>, identity: InstanceIdentity) -> Self {
        Self {
            bus,
            identity,
            wait: DEFAULT_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Send `request.command` at high priority and classify the replies.
    ///
    /// A timeout is not an error: it yields `TriggerStatus::Error` unless some
    /// lines were already matched.
    pub async fn check_chat_triggers(
        &self,
        rule: &TriggerRule,
        request: TriggerRequest,
    ) -> Result<ChatTriggerResult, IntegrityViolation> {
        let expected = if request.target_instances.is_empty() {
            self.bus
                .registry()
                .instances_of_type(InstanceType::Minecraft)
                .len()
        } else {
            request.target_instances.len()
        }
        .max(1);

        // Listen before sending so no reply can slip through.
        let (subscription, mut lines) = self.bus.subscribe_channel(&[EventKind::MinecraftChat]);

        let context = self
            .identity
            .context()
            .with_bridge(request.bridge_id.clone());
        let send = BusEvent::new(
            context,
            EventPayload::MinecraftSend(MinecraftSendEvent {
                target_instances: request.target_instances.clone(),
                priority: CommandPriority::High,
                command: request.command.clone(),
            }),
        );
        if let Err(e) = self.bus.publish(send) {
            self.bus.unsubscribe(subscription);
            return Err(e);
        }

        let mut collector = Collector {
            rule,
            username: request.username,
            targets: request.target_instances,
            expected,
            succeeded: HashSet::new(),
            failed: false,
            messages: Vec::new(),
        };

        let outcome = bounded(self.wait, async {
            while let Some(event) = lines.recv().await {
                if let EventPayload::MinecraftChat(chat) = &event.payload {
                    if collector.observe(&event.context.instance_name, &chat.message) {
                        break;
                    }
                }
            }
        })
        .await;
        self.bus.unsubscribe(subscription);

        let result = collector.finish();
        debug!(
            rule = %rule.name,
            command = %request.command,
            status = ?result.status,
            timed_out = outcome.is_timed_out(),
            "Chat trigger check finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::bus::InstanceRegistry;
    use crate::common::events::MinecraftChatEvent;

    fn setup() -> (Arc<EventBus>, InstanceIdentity, ChatTriggerCorrelator) {
        let registry = Arc::new(InstanceRegistry::new());
        let miner = InstanceIdentity::new("miner1", InstanceType::Minecraft);
        let correlator = InstanceIdentity::internal("correlator", InstanceType::Main);
        registry.register(miner.clone()).unwrap();
        registry.register(correlator.clone()).unwrap();
        let bus = Arc::new(EventBus::new(registry));
        let checker = ChatTriggerCorrelator::new(Arc::clone(&bus), correlator);
        (bus, miner, checker)
    }

    /// Answer the next `MinecraftSend` with the given lines.
    fn reply_with(bus: &Arc<EventBus>, miner: &InstanceIdentity, replies: &[&str]) {
        let (_, mut sends) = bus.subscribe_channel(&[EventKind::MinecraftSend]);
        let bus = Arc::clone(bus);
        let miner = miner.clone();
        let replies: Vec<String> = replies.iter().map(|s| s.to_string()).collect();
        tokio::spawn(async move {
            let _ = sends.recv().await;
            for line in replies {
                bus.publish(BusEvent::new(
                    miner.context(),
                    EventPayload::MinecraftChat(MinecraftChatEvent { message: line }),
                ))
                .unwrap();
            }
        });
    }

    fn request(command: &str, username: &str) -> TriggerRequest {
        TriggerRequest {
            command: command.to_string(),
            username: username.to_string(),
            target_instances: vec!["miner1".to_string()],
            bridge_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resolves_before_timeout() {
        let (bus, miner, checker) = setup();
        let rule = TriggerRule::new("join", &[r"^(\w+) joined the guild!"], &[]).unwrap();
        reply_with(&bus, &miner, &["Alex joined the guild!", "Steve joined the guild!"]);

        let started = Instant::now();
        let result = checker
            .check_chat_triggers(&rule, request("/g accept Steve", "Steve"))
            .await
            .unwrap();

        assert_eq!(result.status, TriggerStatus::Success);
        assert!(started.elapsed() < DEFAULT_WAIT);
        assert_eq!(
            result.messages,
            vec![TriggerMessage {
                instance_name: "miner1".to_string(),
                content: "Steve joined the guild!".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_username_does_not_resolve() {
        let (bus, miner, checker) = setup();
        let rule = TriggerRule::new("join", &[r"^(\w+) joined the guild!"], &[]).unwrap();
        reply_with(&bus, &miner, &["Alex joined the guild!"]);

        let started = Instant::now();
        let result = checker
            .check_chat_triggers(&rule, request("/g accept Steve", "Steve"))
            .await
            .unwrap();

        assert_eq!(result.status, TriggerStatus::Error);
        assert!(result.messages.is_empty());
        assert!(started.elapsed() >= DEFAULT_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_lines_and_unrelated_noise() {
        let (bus, miner, checker) = setup();
        let rules = TriggerRuleSet::builtin().unwrap();
        let kick = rules.get("kick").unwrap();
        reply_with(
            &bus,
            &miner,
            &["Guild > [MVP+] Alex: lol", "§cYou cannot kick this player!"],
        );

        let result = checker
            .check_chat_triggers(&kick, request("/g kick Steve spam", "Steve"))
            .await
            .unwrap();

        assert_eq!(result.status, TriggerStatus::Failed);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].content, "You cannot kick this player!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_carries_high_priority_and_targets() {
        let (bus, _miner, checker) = setup();
        let (_, mut sends) = bus.subscribe_channel(&[EventKind::MinecraftSend]);
        let rule = TriggerRule::new("noop", &[], &[]).unwrap();
        let checker = checker.with_wait(Duration::from_millis(100));

        checker
            .check_chat_triggers(&rule, request("/g mute Steve 1h", "Steve"))
            .await
            .unwrap();

        let sent = sends.try_recv().unwrap();
        match &sent.payload {
            EventPayload::MinecraftSend(send) => {
                assert_eq!(send.priority, CommandPriority::High);
                assert_eq!(send.command, "/g mute Steve 1h");
                assert_eq!(send.target_instances, vec!["miner1".to_string()]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_builtin_rules_accept_rank_prefix() {
        let rules = TriggerRuleSet::builtin().unwrap();
        assert_eq!(rules.version(), RULES_VERSION);

        let invite = rules.get("invite").unwrap();
        let line = "You invited [VIP] Steve to your guild. They have 5 minutes to accept.";
        let captures = invite.success[0].captures(line).unwrap().unwrap();
        assert_eq!(captures.name("username").unwrap().as_str(), "Steve");

        let mute = rules.get("mute").unwrap();
        assert!(mute.success[0]
            .is_match("[MVP++] Alex has muted [VIP] Steve for 30d")
            .unwrap());
        assert!(rules.get("nonexistent").is_none());
    }
}
