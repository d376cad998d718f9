//! Bridge membership and serialized platform delivery.
//!
//! ## Module Structure
//!
//! - `resolver`: which bridge an instance or channel belongs to
//! - `handler`: the `BridgeHandler` capability trait adapters implement
//! - `dispatcher`: the `Bridge` worker serializing delivery per destination

pub mod dispatcher;
pub mod handler;
pub mod resolver;

pub use dispatcher::Bridge;
pub use handler::{BridgeHandler, ErrorSink, LogErrorSink};
pub use resolver::{BridgeResolver, ResolvedBridge};
