//! Mute/ban ledger keyed by any alias of a person.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::error::PersistError;
use crate::common::persist::JsonFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunishmentType {
    Mute,
    Ban,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentRecord {
    #[serde(rename = "type")]
    pub kind: PunishmentType,
    /// Usernames, uuids and platform ids of the punished person.
    pub identifiers: Vec<String>,
    pub till: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

impl PunishmentRecord {
    pub fn matches(&self, identifier: &str) -> bool {
        self.identifiers
            .iter()
            .any(|known| known.eq_ignore_ascii_case(identifier))
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.till > now
    }

    fn shares_identifier(&self, other: &PunishmentRecord) -> bool {
        other.identifiers.iter().any(|id| self.matches(id))
    }
}

pub struct PunishmentStore {
    records: Mutex<Vec<PunishmentRecord>>,
    file: Option<JsonFile>,
}

impl PunishmentStore {
    /// A ledger that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            file: None,
        }
    }

    /// Load the ledger from `file`, dropping entries that already expired.
    pub fn open(file: JsonFile) -> Result<Self, PersistError> {
        let mut records: Vec<PunishmentRecord> = file.load()?;
        let now = Utc::now();
        records.retain(|r| r.is_active_at(now));
        info!(
            path = %file.path().display(),
            "Loaded {} active punishments",
            records.len()
        );
        Ok(Self {
            records: Mutex::new(records),
            file: Some(file),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PunishmentRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, records: &[PunishmentRecord]) -> Result<(), PersistError> {
        match &self.file {
            Some(file) => file.save(&records),
            None => Ok(()),
        }
    }

    /// Store `record`, absorbing records of the same type that share an alias.
    ///
    /// Returns the merged record as stored.
    pub fn add(&self, mut record: PunishmentRecord) -> Result<PunishmentRecord, PersistError> {
        let mut records = self.lock();

        records.retain(|existing| {
            if existing.kind != record.kind || !existing.shares_identifier(&record) {
                return true;
            }
            for id in &existing.identifiers {
                if !record.matches(id) {
                    record.identifiers.push(id.clone());
                }
            }
            false
        });

        debug!(kind = ?record.kind, identifiers = ?record.identifiers, till = %record.till, "Punishment added");
        records.push(record.clone());
        self.flush(&records)?;
        Ok(record)
    }

    /// Lift every punishment of `kind` for `identifier`.
    ///
    /// Returns the first lifted record, if there was one.
    pub fn remove(
        &self,
        kind: PunishmentType,
        identifier: &str,
    ) -> Result<Option<PunishmentRecord>, PersistError> {
        let mut records = self.lock();
        let mut removed = None;
        records.retain(|existing| {
            if existing.kind == kind && existing.matches(identifier) {
                removed.get_or_insert_with(|| existing.clone());
                false
            } else {
                true
            }
        });
        if removed.is_some() {
            self.flush(&records)?;
        }
        Ok(removed)
    }

    pub fn find_active(&self, kind: PunishmentType, identifier: &str) -> Option<PunishmentRecord> {
        self.find_active_at(kind, identifier, Utc::now())
    }

    pub fn find_active_at(
        &self,
        kind: PunishmentType,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Option<PunishmentRecord> {
        self.lock()
            .iter()
            .find(|r| r.kind == kind && r.matches(identifier) && r.is_active_at(now))
            .cloned()
    }

    pub fn all(&self) -> Vec<PunishmentRecord> {
        self.lock().clone()
    }
}
