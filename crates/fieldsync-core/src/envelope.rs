//! Versioned envelopes: the unit of exchange between local storage, the
//! remote replica and the broadcast bus.
//!
//! Decoding goes through JSON `Value` first so envelopes written by an older
//! schema can be migrated before they are deserialized into current types.

use crate::clock::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope has no version field")]
    MissingVersion,

    #[error("No migration path from version {from} to {to}")]
    NoMigrationPath { from: u32, to: u32 },

    #[error("Migration {from}->{to} failed: {reason}")]
    MigrationFailed { from: u32, to: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedEnvelope<T> {
    pub version: u32,
    pub timestamp: Timestamp,
    pub owner_id: String,
    pub project_id: String,
    pub data: T,
}

impl<T> VersionedEnvelope<T> {
    pub fn new(timestamp: Timestamp, owner_id: &str, project_id: &str, data: T) -> Self {
        Self {
            version: SCHEMA_VERSION,
            timestamp,
            owner_id: owner_id.to_string(),
            project_id: project_id.to_string(),
            data,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> VersionedEnvelope<U> {
        VersionedEnvelope {
            version: self.version,
            timestamp: self.timestamp,
            owner_id: self.owner_id,
            project_id: self.project_id,
            data: f(self.data),
        }
    }
}

impl<T: Serialize> VersionedEnvelope<T> {
    pub fn to_value(&self) -> Result<VersionedEnvelope<Value>> {
        Ok(VersionedEnvelope {
            version: self.version,
            timestamp: self.timestamp,
            owner_id: self.owner_id.clone(),
            project_id: self.project_id.clone(),
            data: serde_json::to_value(&self.data)?,
        })
    }
}

impl VersionedEnvelope<Value> {
    /// Deserialize the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(self) -> Result<VersionedEnvelope<T>> {
        let data = serde_json::from_value(self.data)?;
        Ok(VersionedEnvelope {
            version: self.version,
            timestamp: self.timestamp,
            owner_id: self.owner_id,
            project_id: self.project_id,
            data,
        })
    }
}

/// Rewrites a whole envelope (as JSON) from one version to the next.
pub type MigrationFn = fn(&mut Value) -> std::result::Result<(), String>;

/// Migration table keyed by `(from_version, to_version)`.
#[derive(Clone)]
pub struct Migrations {
    steps: BTreeMap<(u32, u32), MigrationFn>,
    target: u32,
}

impl Default for Migrations {
    fn default() -> Self {
        let mut migrations = Self::empty(SCHEMA_VERSION);
        migrations.register(1, 2, migrate_v1_to_v2);
        migrations
    }
}

impl Migrations {
    /// A table with no registered steps.
    pub fn empty(target: u32) -> Self {
        Self {
            steps: BTreeMap::new(),
            target,
        }
    }

    pub fn register(&mut self, from: u32, to: u32, step: MigrationFn) {
        self.steps.insert((from, to), step);
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Bring `envelope` up to the target version in place.
    ///
    /// Steps are chosen greedily: from each version, the registered step that
    /// jumps furthest without overshooting the target.
    pub fn upgrade(&self, envelope: &mut Value) -> Result<()> {
        let mut version = read_version(envelope)?;
        if version == self.target {
            return Ok(());
        }
        if version > self.target {
            return Err(EnvelopeError::NoMigrationPath {
                from: version,
                to: self.target,
            });
        }

        while version < self.target {
            let next = self
                .steps
                .range((version, version + 1)..=(version, self.target))
                .next_back()
                .map(|(&(_, to), step)| (to, *step));

            let Some((to, step)) = next else {
                return Err(EnvelopeError::NoMigrationPath {
                    from: version,
                    to: self.target,
                });
            };

            step(envelope).map_err(|reason| EnvelopeError::MigrationFailed {
                from: version,
                to,
                reason,
            })?;
            if let Some(obj) = envelope.as_object_mut() {
                obj.insert("version".into(), Value::from(to));
            }
            version = to;
        }
        Ok(())
    }

    /// Parse a raw envelope, migrating it if needed, and decode the payload.
    pub fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<VersionedEnvelope<T>> {
        let mut value: Value = serde_json::from_str(raw)?;
        self.upgrade(&mut value)?;
        Ok(serde_json::from_value(value)?)
    }
}

fn read_version(envelope: &Value) -> Result<u32> {
    envelope
        .get("version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or(EnvelopeError::MissingVersion)
}

/// Fields that held plain millisecond numbers in v1.
const V1_TIMESTAMP_FIELDS: [&str; 3] = ["timestamp", "updatedAt", "lastActiveTime"];

/// v1 -> v2.
///
/// Plain-number timestamps become `{time, writer}` with the legacy writer, and
/// selection rows written before instances existed adopt their image id as
/// their instance id.
fn migrate_v1_to_v2(envelope: &mut Value) -> std::result::Result<(), String> {
    let obj = envelope
        .as_object_mut()
        .ok_or_else(|| "envelope is not an object".to_string())?;

    upgrade_timestamps(obj);
    if let Some(data) = obj.get_mut("data") {
        upgrade_timestamps_in(data);
        if let Some(rows) = data.as_array_mut() {
            for row in rows.iter_mut().filter_map(Value::as_object_mut) {
                if row.contains_key("instanceId") {
                    continue;
                }
                if let Some(image_id) = row.get("imageId").cloned() {
                    row.insert("instanceId".into(), image_id);
                }
            }
        }
    }
    Ok(())
}

fn upgrade_timestamps(obj: &mut Map<String, Value>) {
    for field in V1_TIMESTAMP_FIELDS {
        if let Some(slot) = obj.get_mut(field) {
            if let Some(time) = slot.as_u64() {
                *slot = serde_json::json!({ "time": time, "writer": "0000000000000000" });
            }
        }
    }
}

fn upgrade_timestamps_in(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            upgrade_timestamps(obj);
            for child in obj.values_mut() {
                upgrade_timestamps_in(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                upgrade_timestamps_in(item);
            }
        }
        _ => {}
    }
}
