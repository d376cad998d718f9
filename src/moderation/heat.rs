//! Sliding-window rate limits on privileged actions, per person.
//!
//! Every action of a [`HeatType`] is recorded against the person who issued
//! it. A person is known by several identifiers (username, uuid, Discord id);
//! records sharing any identifier are merged so their histories add up.
//! Actions older than the type's window are pruned lazily.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::error::PersistError;
use crate::common::persist::JsonFile;
use crate::config::{HeatLimitConfig, ModerationConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatType {
    Kick,
    Mute,
    Invite,
    Promote,
    Demote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatResult {
    Allowed,
    /// Close to the limit. Reported at most once per warning interval.
    Warn,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HeatAction {
    timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: HeatType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HeatUser {
    identifiers: Vec<String>,
    #[serde(default)]
    heat_actions: Vec<HeatAction>,
    #[serde(default)]
    last_warning: HashMap<HeatType, DateTime<Utc>>,
}

impl HeatUser {
    fn matches_any(&self, identifiers: &[&str]) -> bool {
        identifiers.iter().any(|id| {
            self.identifiers
                .iter()
                .any(|known| known.eq_ignore_ascii_case(id))
        })
    }

    fn absorb_identifier(&mut self, identifier: &str) {
        if !self
            .identifiers
            .iter()
            .any(|known| known.eq_ignore_ascii_case(identifier))
        {
            self.identifiers.push(identifier.to_string());
        }
    }

    fn absorb(&mut self, other: HeatUser) {
        for id in &other.identifiers {
            self.absorb_identifier(id);
        }
        self.heat_actions.extend(other.heat_actions);
        for (kind, at) in other.last_warning {
            let slot = self.last_warning.entry(kind).or_insert(at);
            if at > *slot {
                *slot = at;
            }
        }
    }
}

pub struct HeatTracker {
    config: ModerationConfig,
    users: Mutex<Vec<HeatUser>>,
    file: Option<JsonFile>,
}

impl HeatTracker {
    pub fn in_memory(config: ModerationConfig) -> Self {
        Self {
            config,
            users: Mutex::new(Vec::new()),
            file: None,
        }
    }

    pub fn open(config: ModerationConfig, file: JsonFile) -> Result<Self, PersistError> {
        let users: Vec<HeatUser> = file.load()?;
        info!(path = %file.path().display(), "Loaded heat for {} identities", users.len());
        Ok(Self {
            config,
            users: Mutex::new(users),
            file: Some(file),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HeatUser>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limits(&self, kind: HeatType) -> &HeatLimitConfig {
        match kind {
            HeatType::Kick => &self.config.kick,
            HeatType::Mute => &self.config.mute,
            HeatType::Invite => &self.config.invite,
            HeatType::Promote => &self.config.promote,
            HeatType::Demote => &self.config.demote,
        }
    }

    fn window(&self, kind: HeatType) -> Duration {
        Duration::seconds(self.limits(kind).expire_secs as i64)
    }

    fn is_immune(&self, identifiers: &[&str]) -> bool {
        identifiers.iter().any(|id| {
            self.config
                .immune
                .iter()
                .any(|immune| immune.eq_ignore_ascii_case(id))
        })
    }

    /// What the next `add` would yield, without recording anything.
    pub fn status(&self, identifiers: &[&str], kind: HeatType) -> HeatResult {
        self.status_at(identifiers, kind, Utc::now())
    }

    pub fn status_at(&self, identifiers: &[&str], kind: HeatType, now: DateTime<Utc>) -> HeatResult {
        let users = self.lock();
        let mut view = HeatUser::default();
        for user in users.iter().filter(|u| u.matches_any(identifiers)) {
            view.absorb(user.clone());
        }
        self.evaluate(&view, identifiers, kind, now)
    }

    /// Record an action and report where it leaves the person.
    pub fn add(&self, identifiers: &[&str], kind: HeatType) -> Result<HeatResult, PersistError> {
        self.add_at(identifiers, kind, Utc::now())
    }

    pub fn add_at(
        &self,
        identifiers: &[&str],
        kind: HeatType,
        now: DateTime<Utc>,
    ) -> Result<HeatResult, PersistError> {
        self.record(identifiers, kind, now, false)
    }

    /// Record the action only if it is not denied.
    pub fn try_add(&self, identifiers: &[&str], kind: HeatType) -> Result<HeatResult, PersistError> {
        self.try_add_at(identifiers, kind, Utc::now())
    }

    pub fn try_add_at(
        &self,
        identifiers: &[&str],
        kind: HeatType,
        now: DateTime<Utc>,
    ) -> Result<HeatResult, PersistError> {
        self.record(identifiers, kind, now, true)
    }

    /// Actions of `kind` inside the window.
    pub fn count(&self, identifiers: &[&str], kind: HeatType) -> usize {
        let now = Utc::now();
        let window = self.window(kind);
        self.lock()
            .iter()
            .filter(|u| u.matches_any(identifiers))
            .flat_map(|u| u.heat_actions.iter())
            .filter(|a| a.kind == kind && a.timestamp > now - window)
            .count()
    }

    fn record(
        &self,
        identifiers: &[&str],
        kind: HeatType,
        now: DateTime<Utc>,
        only_if_allowed: bool,
    ) -> Result<HeatResult, PersistError> {
        let identifiers: Vec<&str> = identifiers
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        if identifiers.is_empty() {
            debug!(?kind, "Heat action without identifiers, not recorded");
            return Ok(self.evaluate(&HeatUser::default(), &identifiers, kind, now));
        }
        let identifiers = identifiers.as_slice();

        let mut users = self.lock();
        let user = self.locate(&mut users, identifiers, now);

        let result = self.evaluate(user, identifiers, kind, now);
        if only_if_allowed && result == HeatResult::Denied {
            debug!(identifiers = ?identifiers, ?kind, "Heat denied, action not recorded");
            self.flush(&users)?;
            return Ok(result);
        }

        user.heat_actions.push(HeatAction {
            timestamp: now,
            kind,
        });
        if result == HeatResult::Warn {
            user.last_warning.insert(kind, now);
        }
        if result != HeatResult::Allowed {
            warn!(identifiers = ?user.identifiers, ?kind, ?result, "Heat limit approached");
        }

        self.flush(&users)?;
        Ok(result)
    }

    /// Merge every record overlapping `identifiers` into one, prune it and
    /// return it.
    fn locate<'a>(
        &self,
        users: &'a mut Vec<HeatUser>,
        identifiers: &[&str],
        now: DateTime<Utc>,
    ) -> &'a mut HeatUser {
        let mut merged = HeatUser::default();
        let mut index = 0;
        while index < users.len() {
            if users[index].matches_any(identifiers) {
                merged.absorb(users.swap_remove(index));
            } else {
                index += 1;
            }
        }
        for id in identifiers {
            merged.absorb_identifier(id);
        }

        merged
            .heat_actions
            .retain(|a| a.timestamp > now - self.window(a.kind));
        merged.heat_actions.sort_by_key(|a| a.timestamp);

        users.push(merged);
        let last = users.len() - 1;
        &mut users[last]
    }

    /// Classify the count the person would reach with one more action.
    fn evaluate(
        &self,
        user: &HeatUser,
        identifiers: &[&str],
        kind: HeatType,
        now: DateTime<Utc>,
    ) -> HeatResult {
        if self.is_immune(identifiers) || self.is_immune(&as_strs(&user.identifiers)) {
            return HeatResult::Allowed;
        }

        let limits = self.limits(kind);
        if limits.max <= 0 {
            return HeatResult::Allowed;
        }

        let window = self.window(kind);
        let count = user
            .heat_actions
            .iter()
            .filter(|a| a.kind == kind && a.timestamp > now - window)
            .count() as i64
            + 1;

        let warn_limit = if limits.max == 1 {
            limits.max
        } else {
            (limits.max as f64 * 0.8).floor() as i64
        };

        if count >= limits.max {
            HeatResult::Denied
        } else if count >= warn_limit {
            let warn_every = Duration::seconds(self.config.warn_every_secs as i64);
            match user.last_warning.get(&kind) {
                Some(last) if now - *last < warn_every => HeatResult::Allowed,
                _ => HeatResult::Warn,
            }
        } else {
            HeatResult::Allowed
        }
    }

    fn flush(&self, users: &[HeatUser]) -> Result<(), PersistError> {
        match &self.file {
            Some(file) => file.save(&users),
            None => Ok(()),
        }
    }
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}
