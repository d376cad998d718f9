//! Event bus and instance identity registry.
//!
//! - `registry`: unique, well-formed names for every participant
//! - `event_bus`: typed publish/subscribe keyed by `EventKind`

pub mod event_bus;
pub mod registry;

pub use event_bus::{EventBus, SubscriptionId};
pub use registry::{InstanceIdentity, InstanceRegistry};
