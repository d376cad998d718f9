//! JSON documents persisted next to the configuration.
//!
//! Ledgers are read once at startup and written back in full after every
//! mutation. Writes go to a sibling temp file first so a crash never leaves a
//! truncated document behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::common::error::PersistError;

/// A JSON file holding one serialized document.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current snapshot, or `T::default()` when the file is absent.
    pub fn load<T>(&self) -> Result<T, PersistError>
    where
        T: DeserializeOwned + Default,
    {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted document, starting empty");
                return Ok(T::default());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        if content.trim().is_empty() {
            return Ok(T::default());
        }

        serde_json::from_str(&content).map_err(|source| PersistError::Json {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Write `value` back, replacing the previous document.
    pub fn save<T>(&self, value: &T) -> Result<(), PersistError>
    where
        T: Serialize,
    {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
            }
        }

        let json = serde_json::to_string_pretty(value).map_err(|source| PersistError::Json {
            path: self.path.display().to_string(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> PersistError {
        PersistError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
