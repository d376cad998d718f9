//! Instance identity registry.
//!
//! Every component that publishes on the bus or is addressed by name must
//! register first. Names are unique ignoring case and must be made of
//! `[A-Za-z0-9_-]` once the reserved internal prefix is stripped.

use std::sync::{PoisonError, RwLock};

use tracing::{debug, error};

use crate::common::error::IntegrityViolation;
use crate::common::{EventContext, InstanceType};

/// Prefix reserved for utilities owned by the process itself.
pub const INTERNAL_PREFIX: &str = "internal/";

/// A uniquely named, typed participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_name: String,
    pub instance_type: InstanceType,
}

impl InstanceIdentity {
    pub fn new(instance_name: impl Into<String>, instance_type: InstanceType) -> Self {
        Self {
            instance_name: instance_name.into(),
            instance_type,
        }
    }

    /// Identity for a process-internal utility (`internal/<name>`).
    pub fn internal(name: &str, instance_type: InstanceType) -> Self {
        Self::new(format!("{INTERNAL_PREFIX}{name}"), instance_type)
    }

    /// Fresh event context originating from this identity.
    pub fn context(&self) -> EventContext {
        EventContext::new(self.instance_name.clone(), self.instance_type)
    }
}

/// Check that a name is well formed.
pub fn validate_instance_name(name: &str) -> Result<(), IntegrityViolation> {
    let bare = name.strip_prefix(INTERNAL_PREFIX).unwrap_or(name);

    if bare.is_empty() {
        return Err(IntegrityViolation::MalformedName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }

    if let Some(bad) = bare
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(IntegrityViolation::MalformedName {
            name: name.to_string(),
            reason: format!("character {bad:?} is not allowed (use A-Z, a-z, 0-9, '_' or '-')"),
        });
    }

    Ok(())
}

/// Registry of all live identities.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    identities: RwLock<Vec<InstanceIdentity>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity.
    ///
    /// Fails without touching the registry when the name is malformed or
    /// already taken by another live identity.
    pub fn register(&self, identity: InstanceIdentity) -> Result<(), IntegrityViolation> {
        if let Err(violation) = validate_instance_name(&identity.instance_name) {
            error!("{}", violation);
            return Err(violation);
        }

        let mut identities = self
            .identities
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = identities
            .iter()
            .find(|existing| existing.instance_name.eq_ignore_ascii_case(&identity.instance_name))
        {
            let violation = IntegrityViolation::DuplicateName {
                name: identity.instance_name.clone(),
                existing: existing.instance_name.clone(),
            };
            error!("{}", violation);
            return Err(violation);
        }

        debug!(
            instance = %identity.instance_name,
            instance_type = %identity.instance_type,
            "Registered instance"
        );
        identities.push(identity);
        Ok(())
    }

    /// Remove an identity when its component is torn down.
    ///
    /// Returns `true` if the name was registered.
    pub fn unregister(&self, instance_name: &str) -> bool {
        let mut identities = self
            .identities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = identities.len();
        identities.retain(|identity| !identity.instance_name.eq_ignore_ascii_case(instance_name));
        before != identities.len()
    }

    /// Whether `instance_name` belongs to a live identity (exact match).
    pub fn is_registered(&self, instance_name: &str) -> bool {
        self.identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|identity| identity.instance_name == instance_name)
    }

    /// Live identities of one type, in registration order.
    pub fn instances_of_type(&self, instance_type: InstanceType) -> Vec<InstanceIdentity> {
        self.identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|identity| identity.instance_type == instance_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Re-check every pair of live identities.
    ///
    /// `register` already refuses duplicates; this is the startup sanity pass
    /// run once all components are wired.
    pub fn verify_integrity(&self) -> Result<(), IntegrityViolation> {
        let identities = self
            .identities
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for (i, left) in identities.iter().enumerate() {
            validate_instance_name(&left.instance_name)?;
            for right in identities.iter().skip(i + 1) {
                if left.instance_name.eq_ignore_ascii_case(&right.instance_name) {
                    return Err(IntegrityViolation::DuplicateName {
                        name: right.instance_name.clone(),
                        existing: left.instance_name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
