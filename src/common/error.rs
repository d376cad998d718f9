//! Error types for the application.

use thiserror::Error;

/// Violations of the instance identity rules.
///
/// These point at a wiring or configuration bug, so callers are expected to
/// treat them as fatal instead of retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("Instance name '{name}' is already registered (conflicts with '{existing}')")]
    DuplicateName { name: String, existing: String },

    #[error("Instance name '{name}' is malformed: {reason}")]
    MalformedName { name: String, reason: String },

    #[error("Instance '{name}' published an event without being registered")]
    UnregisteredPublisher { name: String },
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Errors reading or writing a persisted JSON document.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the outbound command scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendQueueError {
    #[error("Send primitive failed: {message}")]
    SendFailed { message: String },

    #[error("Command was dropped before dispatch")]
    Dropped,
}

/// Errors from the exclusive Limbo gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimboError {
    #[error("Timed out after {waited_ms}ms waiting for the limbo gate")]
    AcquireTimedOut { waited_ms: u128 },

    #[error("Limbo gate is closed")]
    Closed,
}
