//! Engine configuration.

use crate::model::DebounceClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tunables for one engine instance. Every field has a default, so an empty
/// JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Project name within the owner's account
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// Debounce for images, selections and bulk defects (default: 1s)
    #[serde(default = "default_structural_debounce_ms")]
    pub structural_debounce_ms: u64,

    /// Debounce for instance metadata and form fields (default: 3s)
    #[serde(default = "default_metadata_debounce_ms")]
    pub metadata_debounce_ms: u64,

    /// Debounce for session and sort snapshots (default: 15s)
    #[serde(default = "default_snapshot_debounce_ms")]
    pub snapshot_debounce_ms: u64,

    /// Poll-sync interval (default: 30s)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Entries kept in the bulk-defect undo log
    #[serde(default = "default_undo_capacity")]
    pub undo_capacity: usize,

    /// First segment of every local storage key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            structural_debounce_ms: default_structural_debounce_ms(),
            metadata_debounce_ms: default_metadata_debounce_ms(),
            snapshot_debounce_ms: default_snapshot_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            undo_capacity: default_undo_capacity(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_project_name() -> String {
    crate::identity::DEFAULT_PROJECT_NAME.to_string()
}

fn default_structural_debounce_ms() -> u64 {
    1_000
}

fn default_metadata_debounce_ms() -> u64 {
    3_000
}

fn default_snapshot_debounce_ms() -> u64 {
    15_000
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_undo_capacity() -> usize {
    20
}

fn default_key_prefix() -> String {
    "fieldsync".to_string()
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() || self.key_prefix.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "keyPrefix must be non-empty and contain no ':' (got {:?})",
                self.key_prefix
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("pollIntervalMs must be positive".into()));
        }
        Ok(())
    }

    pub fn debounce_ms(&self, class: DebounceClass) -> u64 {
        match class {
            DebounceClass::Structural => self.structural_debounce_ms,
            DebounceClass::Metadata => self.metadata_debounce_ms,
            DebounceClass::Snapshot => self.snapshot_debounce_ms,
        }
    }
}
