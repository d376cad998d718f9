//! Discord side of the bridge.
//!
//! ## Module Structure
//!
//! - `api`: outbound REST calls behind the `PlatformApi` trait
//! - `bridge`: `DiscordBridge`, rendering bus events into channels
//! - `handler`: gateway events, publishing Discord chat onto the bus
//! - `commands`: officer guild commands
//! - `client`: gateway connection with reconnect

pub mod api;
pub mod bridge;
pub mod client;
pub mod commands;
pub mod handler;

pub use api::{PlatformApi, SerenityApi};
pub use bridge::DiscordBridge;
pub use client::DiscordClient;
pub use commands::CommandExecutor;
pub use handler::DiscordHandler;
