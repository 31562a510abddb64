//! Registry source backed by a TOML or JSON file.
//!
//! Stands in for the master pushing registry updates: every modification of
//! the file is delivered as the next registry version.

use rly_cdc::ConsumerRegistry;
use rly_core::{RelayError, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

pub struct RegistryFile {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    version: i32,
}

impl RegistryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
            version: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version of the last registry successfully read, 0 before the first.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Re-read the file if it changed since the last call.
    ///
    /// Returns the parsed registry with its new version. Unreadable or
    /// malformed contents are logged and do not consume a version, so the
    /// next successful read still supersedes the last good one.
    pub fn poll(&mut self) -> Option<(ConsumerRegistry, i32)> {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(
                    target: "relay::registry",
                    path = %self.path.display(),
                    error = %e,
                    "Registry file not readable"
                );
                return None;
            },
        };

        if self.last_modified == Some(modified) {
            return None;
        }
        self.last_modified = Some(modified);

        match load(&self.path) {
            Ok(registry) => {
                self.version = self.version.saturating_add(1);
                debug!(
                    target: "relay::registry",
                    path = %self.path.display(),
                    version = self.version,
                    producers = registry.producers.len(),
                    "Registry file loaded"
                );
                Some((registry, self.version))
            },
            Err(e) => {
                warn!(
                    target: "relay::registry",
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring unparsable registry file"
                );
                None
            },
        }
    }
}

pub fn load(path: &Path) -> Result<ConsumerRegistry> {
    let content = std::fs::read_to_string(path)?;

    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "json" => serde_json::from_str(&content)
            .map_err(|e| RelayError::Config(format!("JSON parse error: {}", e))),
        _ => toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("TOML parse error: {}", e))),
    }
}
