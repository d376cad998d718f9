//! Outbound command scheduler for one game connection.
//!
//! The game server rate-limits and silently drops rapid or repeated lines,
//! so every outgoing line goes through this queue. Lines are classified into
//! [`CommandType`]s, ordered by priority (FIFO on ties) and paced so that
//! after each dispatch the queue waits the longest cooldown of the
//! dispatched line's types. A follow-up line sharing the dispatched line's
//! correlation id (and not itself high priority) only waits the shortest of
//! those cooldowns, so related commands are batched faster.
//!
//! The wait is polled in short slices so a newly queued follow-up can cut it
//! short. The cycle stops when the queue is empty and restarts on the next
//! enqueue. `Instant` commands skip the queue altogether.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::common::error::SendQueueError;
use crate::common::CommandPriority;

/// Granularity of the pacing wait.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// First words of lines that send a chat message.
const CHAT_PREFIXES: &[&str] = &[
    "/ac", "/achat", "/pc", "/pchat", "/gc", "/gchat", "/oc", "/ochat", "/msg", "/w", "/tell",
    "/whisper", "/r", "/reply",
];

/// First words of guild management commands.
const GUILD_PREFIXES: &[&str] = &["/g", "/guild"];

/// Guild sub-commands that are really chat messages (`/g chat hi`).
const GUILD_CHAT_SUBCOMMANDS: &[&str] = &["chat", "c", "officerchat", "oc", "o"];

/// Send primitive of the underlying connection. Fire-and-forget.
pub trait GameSender: Send + Sync + 'static {
    fn send(&self, line: &str) -> anyhow::Result<()>;
}

/// Classification of an outgoing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    HighPriority,
    Generic,
    GuildCommand,
    ChatMessage,
}

impl CommandType {
    const ALL: [CommandType; 4] = [
        CommandType::HighPriority,
        CommandType::Generic,
        CommandType::GuildCommand,
        CommandType::ChatMessage,
    ];

    /// Queue ordering value; lower is more urgent.
    pub fn priority(self) -> u8 {
        match self {
            Self::HighPriority => 1,
            Self::Generic => 3,
            Self::GuildCommand => 5,
            Self::ChatMessage => 10,
        }
    }

    /// Minimum time between a line of this type and the next dispatch.
    pub fn cooldown(self) -> Duration {
        match self {
            Self::HighPriority => Duration::from_millis(700),
            Self::Generic => Duration::from_millis(1000),
            Self::GuildCommand => Duration::from_millis(2000),
            Self::ChatMessage => Duration::from_millis(3000),
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::HighPriority => 1,
            Self::Generic => 1 << 1,
            Self::GuildCommand => 1 << 2,
            Self::ChatMessage => 1 << 3,
        }
    }
}

/// Small set of [`CommandType`]s.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandTypes(u8);

impl CommandTypes {
    pub fn insert(&mut self, command_type: CommandType) {
        self.0 |= command_type.bit();
    }

    pub fn contains(self, command_type: CommandType) -> bool {
        self.0 & command_type.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = CommandType> {
        CommandType::ALL
            .into_iter()
            .filter(move |t| self.contains(*t))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Most urgent priority among the members.
    pub fn priority(self) -> u8 {
        self.iter()
            .map(CommandType::priority)
            .min()
            .unwrap_or(CommandType::Generic.priority())
    }

    fn longest_cooldown(self) -> Duration {
        self.iter()
            .map(CommandType::cooldown)
            .max()
            .unwrap_or(CommandType::Generic.cooldown())
    }

    fn shortest_cooldown(self) -> Duration {
        self.iter()
            .map(CommandType::cooldown)
            .min()
            .unwrap_or(CommandType::Generic.cooldown())
    }
}

impl fmt::Debug for CommandTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Classify a line by its first words plus the caller's explicit priority.
pub fn classify(command: &str, priority: CommandPriority) -> CommandTypes {
    let mut types = CommandTypes::default();

    if matches!(priority, CommandPriority::High | CommandPriority::Instant) {
        types.insert(CommandType::HighPriority);
    }

    let mut words = command.split_whitespace();
    let first = words.next().unwrap_or("").to_lowercase();

    if !first.starts_with('/') {
        types.insert(CommandType::ChatMessage);
    } else if CHAT_PREFIXES.contains(&first.as_str()) {
        types.insert(CommandType::ChatMessage);
    } else if GUILD_PREFIXES.contains(&first.as_str()) {
        let sub = words.next().unwrap_or("").to_lowercase();
        if GUILD_CHAT_SUBCOMMANDS.contains(&sub.as_str()) {
            types.insert(CommandType::ChatMessage);
        } else {
            types.insert(CommandType::GuildCommand);
        }
    }

    if types.is_empty() {
        types.insert(CommandType::Generic);
    }
    types
}

struct QueueEntry {
    command: String,
    priority: u8,
    types: CommandTypes,
    correlation_id: Option<String>,
    done: oneshot::Sender<Result<(), SendQueueError>>,
}

#[derive(Default)]
struct QueueState {
    /// Sorted by ascending priority, FIFO among equals.
    entries: Vec<QueueEntry>,
    running: bool,
    last_correlation: HashMap<CommandType, String>,
}

/// The outbound scheduler of one game connection.
pub struct SendQueue {
    name: String,
    sender: Arc<dyn GameSender>,
    state: Mutex<QueueState>,
}

impl SendQueue {
    pub fn new(name: impl Into<String>, sender: Arc<dyn GameSender>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            sender,
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Queue a line and wait until it has been handed to the connection.
    pub async fn send(
        self: &Arc<Self>,
        command: impl Into<String>,
        priority: CommandPriority,
        correlation_id: Option<String>,
    ) -> Result<(), SendQueueError> {
        self.enqueue(command, priority, correlation_id)
            .await
            .unwrap_or(Err(SendQueueError::Dropped))
    }

    /// Queue a line; the receiver resolves once it is dispatched.
    pub fn enqueue(
        self: &Arc<Self>,
        command: impl Into<String>,
        priority: CommandPriority,
        correlation_id: Option<String>,
    ) -> oneshot::Receiver<Result<(), SendQueueError>> {
        let command = command.into();
        let types = classify(&command, priority);
        let (done_tx, done_rx) = oneshot::channel();

        if priority == CommandPriority::Instant {
            let result = self.dispatch(&command, types, correlation_id.as_deref());
            let _ = done_tx.send(result);
            return done_rx;
        }

        let entry = QueueEntry {
            priority: types.priority(),
            command,
            types,
            correlation_id,
            done: done_tx,
        };

        let start_cycle = {
            let mut state = self.lock();
            let position = state
                .entries
                .partition_point(|queued| queued.priority <= entry.priority);
            trace!(
                instance = %self.name,
                command = %entry.command,
                ?types,
                position,
                "Queued command"
            );
            state.entries.insert(position, entry);
            !std::mem::replace(&mut state.running, true)
        };

        if start_cycle {
            tokio::spawn(Arc::clone(self).run_cycle());
        }

        done_rx
    }

    /// Correlation id of the last dispatched line carrying `command_type`.
    pub fn last_correlation_id(&self, command_type: CommandType) -> Option<String> {
        self.lock().last_correlation.get(&command_type).cloned()
    }

    /// Lines waiting for dispatch.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand one line to the connection and remember its correlation id.
    fn dispatch(
        &self,
        command: &str,
        types: CommandTypes,
        correlation_id: Option<&str>,
    ) -> Result<(), SendQueueError> {
        self.sender.send(command).map_err(|e| SendQueueError::SendFailed {
            message: format!("{e:#}"),
        })?;

        debug!(instance = %self.name, ?types, "Sent: {}", command);

        if let Some(id) = correlation_id {
            let mut state = self.lock();
            for command_type in types.iter() {
                state.last_correlation.insert(command_type, id.to_string());
            }
        }
        Ok(())
    }

    async fn run_cycle(self: Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.lock();
                if state.entries.is_empty() {
                    state.running = false;
                    return;
                }
                state.entries.remove(0)
            };

            let dispatched_at = Instant::now();
            let result = self.dispatch(&entry.command, entry.types, entry.correlation_id.as_deref());
            let failed = result.is_err();
            if let Err(e) = &result {
                error!(instance = %self.name, command = %entry.command, "Send queue cycle failed: {}", e);
            }
            let _ = entry.done.send(result);

            // Nothing was sent, no cooldown.
            if failed {
                continue;
            }

            self.pace(dispatched_at, entry.types, entry.correlation_id.as_deref())
                .await;
        }
    }

    /// Sleep until the dispatched line's cooldown has elapsed, re-evaluating
    /// the requirement every slice since the queue head may change meanwhile.
    async fn pace(&self, dispatched_at: Instant, types: CommandTypes, correlation_id: Option<&str>) {
        loop {
            let required = {
                let state = self.lock();
                required_gap(state.entries.first(), types, correlation_id)
            };
            let elapsed = dispatched_at.elapsed();
            if elapsed >= required {
                return;
            }
            tokio::time::sleep((required - elapsed).min(POLL_SLICE)).await;
        }
    }
}

fn required_gap(
    next: Option<&QueueEntry>,
    dispatched: CommandTypes,
    correlation_id: Option<&str>,
) -> Duration {
    let follow_up = match (next, correlation_id) {
        (Some(next), Some(id)) => {
            next.correlation_id.as_deref() == Some(id)
                && !next.types.contains(CommandType::HighPriority)
        }
        _ => false,
    };

    if follow_up {
        dispatched.shortest_cooldown()
    } else {
        dispatched.longest_cooldown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(Instant, String)>>,
        fail_next: Mutex<bool>,
    }

    impl RecordingSender {
        fn lines(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
        }

        fn gap(&self, a: usize, b: usize) -> Duration {
            let sent = self.sent.lock().unwrap();
            sent[b].0 - sent[a].0
        }
    }

    impl GameSender for RecordingSender {
        fn send(&self, line: &str) -> anyhow::Result<()> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                anyhow::bail!("socket closed");
            }
            self.sent
                .lock()
                .unwrap()
                .push((Instant::now(), line.to_string()));
            Ok(())
        }
    }

    fn queue() -> (Arc<SendQueue>, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        (SendQueue::new("miner1", sender.clone()), sender)
    }

    #[test]
    fn test_classification() {
        use CommandType::*;
        let types = |c: &str, p| classify(c, p).iter().collect::<Vec<_>>();

        assert_eq!(types("/gc hello", CommandPriority::Default), vec![ChatMessage]);
        assert_eq!(types("hello there", CommandPriority::Default), vec![ChatMessage]);
        assert_eq!(types("/g kick Steve", CommandPriority::Default), vec![GuildCommand]);
        assert_eq!(types("/guild chat hi", CommandPriority::Default), vec![ChatMessage]);
        assert_eq!(types("/lobby", CommandPriority::Default), vec![Generic]);
        assert_eq!(
            types("/g invite Steve", CommandPriority::High),
            vec![HighPriority, GuildCommand]
        );
        assert_eq!(classify("/g invite Steve", CommandPriority::High).priority(), 1);
        assert_eq!(classify("/oc hi", CommandPriority::Default).priority(), 10);
        assert_eq!(classify("/who", CommandPriority::Default).priority(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_messages_are_spaced_from_dispatch() {
        let (queue, sender) = queue();

        let first = queue.enqueue("/gc one", CommandPriority::Default, None);
        let second = queue.enqueue("/gc two", CommandPriority::Default, None);
        tokio_test::assert_ok!(first.await.unwrap());
        tokio_test::assert_ok!(second.await.unwrap());

        assert_eq!(sender.lines(), vec!["/gc one", "/gc two"]);
        assert!(sender.gap(0, 1) >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_bypasses_queue() {
        let (queue, sender) = queue();

        let a = queue.enqueue("/gc a", CommandPriority::Default, None);
        let b = queue.enqueue("/gc b", CommandPriority::Default, None);
        queue
            .send("/g online", CommandPriority::Instant, None)
            .await
            .unwrap();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(sender.lines(), vec!["/g online", "/gc a", "/gc b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_with_fifo_ties() {
        let (queue, sender) = queue();

        // Dispatched right away; the rest queue up behind its cooldown.
        queue.send("/gc first", CommandPriority::Default, None).await.unwrap();

        let receivers = vec![
            queue.enqueue("/gc chat-1", CommandPriority::Default, None),
            queue.enqueue("/g kick Alex", CommandPriority::Default, None),
            queue.enqueue("/gc chat-2", CommandPriority::Default, None),
            queue.enqueue("/lobby", CommandPriority::Default, None),
            queue.enqueue("/g invite Steve", CommandPriority::High, None),
        ];
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(
            sender.lines(),
            vec![
                "/gc first",
                "/g invite Steve",
                "/lobby",
                "/g kick Alex",
                "/gc chat-1",
                "/gc chat-2",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_with_same_correlation_uses_shortest_cooldown() {
        let (queue, sender) = queue();
        let id = Some("evt-1".to_string());

        let a = queue.enqueue("/g promote Steve", CommandPriority::High, id.clone());
        let b = queue.enqueue("/g promote Alex", CommandPriority::Default, id.clone());
        let c = queue.enqueue("/g promote Notch", CommandPriority::Default, None);
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        c.await.unwrap().unwrap();

        // High+Guild -> follow-up waits only the high priority cooldown.
        assert_eq!(sender.gap(0, 1), Duration::from_millis(700));
        // Guild only, unrelated follow-up -> full guild cooldown.
        assert_eq!(sender.gap(1, 2), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_follow_up_shortens_remaining_wait() {
        let (queue, sender) = queue();
        let id = Some("evt-2".to_string());

        let a = queue.enqueue("/g demote Steve", CommandPriority::High, id.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let b = queue.enqueue("/g demote Alex", CommandPriority::Default, id);
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(sender.gap(0, 1), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_correlation_ids_recorded_per_type() {
        let (queue, _sender) = queue();

        queue
            .send("/g kick Alex spam", CommandPriority::High, Some("evt-9".into()))
            .await
            .unwrap();

        assert_eq!(
            queue.last_correlation_id(CommandType::HighPriority).as_deref(),
            Some("evt-9")
        );
        assert_eq!(
            queue.last_correlation_id(CommandType::GuildCommand).as_deref(),
            Some("evt-9")
        );
        assert_eq!(queue.last_correlation_id(CommandType::ChatMessage), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dispatch_does_not_strand_queued_lines() {
        let (queue, sender) = queue();
        *sender.fail_next.lock().unwrap() = true;

        let a = queue.enqueue("/gc a", CommandPriority::Default, None);
        let b = queue.enqueue("/gc b", CommandPriority::Default, None);

        assert!(matches!(a.await.unwrap(), Err(SendQueueError::SendFailed { .. })));
        let b = tokio::time::timeout(Duration::from_secs(60), b).await;
        tokio_test::assert_ok!(b.expect("queued line was stranded").unwrap());
        assert_eq!(sender.lines(), vec!["/gc b"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_restarts_after_failure_and_after_draining() {
        let (queue, sender) = queue();
        *sender.fail_next.lock().unwrap() = true;

        let failed = queue.send("/gc lost", CommandPriority::Default, None).await;
        assert!(matches!(failed, Err(SendQueueError::SendFailed { .. })));

        queue.send("/gc kept", CommandPriority::Default, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(queue.is_empty());

        queue.send("/gc again", CommandPriority::Default, None).await.unwrap();
        assert_eq!(sender.lines(), vec!["/gc kept", "/gc again"]);
    }
}
