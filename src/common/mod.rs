//! Common utilities and types shared across the application.

pub mod error;
pub mod events;
pub mod persist;
pub mod timeout;

pub use events::{
    BusEvent, ChannelType, CommandPriority, EventContext, EventKind, EventPayload, InstanceType,
};
pub use timeout::{bounded, Bounded};
