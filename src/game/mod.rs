//! Game side: connections to game instances and everything that talks
//! through them.
//!
//! This module contains:
//! - Line transport with reconnect (`connection`)
//! - Outbound pacing (`send_queue`) and duplicate avoidance (`antispam`)
//! - Exclusive connection control (`limbo`)
//! - Chat line parsing (`chat_parser`) and command reply correlation (`triggers`)
//! - The per-connection `MinecraftInstance` and the bus-facing `MinecraftBridge`

pub mod antispam;
pub mod bridge;
pub mod chat_parser;
pub mod connection;
pub mod instance;
pub mod limbo;
pub mod send_queue;
pub mod triggers;

pub use bridge::MinecraftBridge;
pub use instance::MinecraftInstance;
pub use triggers::{ChatTriggerCorrelator, TriggerRuleSet};
