//! Strict conversion between wire/file JSON and [`ReplicaSnapshot`].
//!
//! Nothing read from the remote store or the local file is trusted until it
//! has passed through here.

use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{Alias, ReplicaSnapshot};

/// Decodes a remote user document. A missing document (`null`) is the empty
/// snapshot.
pub fn decode_remote(value: Value) -> Result<ReplicaSnapshot> {
    if value.is_null() {
        return Ok(ReplicaSnapshot::empty());
    }
    if !value.is_object() {
        return Err(Error::Decode(format!(
            "remote document is not an object: {}",
            kind(&value)
        )));
    }
    let snapshot: ReplicaSnapshot = serde_json::from_value(value)?;
    snapshot.validate()?;
    Ok(snapshot)
}

pub fn encode_remote(snapshot: &ReplicaSnapshot) -> Result<Value> {
    snapshot.validate()?;
    Ok(serde_json::to_value(snapshot)?)
}

pub fn encode_alias(alias: &Alias) -> Result<Value> {
    Ok(serde_json::to_value(alias)?)
}

/// Result of reading the local replica file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalFile {
    Snapshot(ReplicaSnapshot),
    /// First-generation file: a bare array of aliases with no tombstones.
    Legacy(ReplicaSnapshot),
}

impl LocalFile {
    pub fn into_snapshot(self) -> ReplicaSnapshot {
        match self {
            LocalFile::Snapshot(s) | LocalFile::Legacy(s) => s,
        }
    }
}

pub fn decode_local(bytes: &[u8]) -> Result<LocalFile> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Array(entries) => {
            let mut snapshot = ReplicaSnapshot::empty();
            for (index, entry) in entries.into_iter().enumerate() {
                match serde_json::from_value::<Alias>(entry) {
                    Ok(alias) if alias.id.is_valid_key() && !alias.name.is_empty() => {
                        snapshot.aliases.insert(alias.id.clone(), alias);
                    }
                    Ok(alias) => warn!(index, id = ?alias.id, "dropping legacy alias with unusable id or name"),
                    Err(e) => warn!(index, error = %e, "dropping unreadable legacy alias"),
                }
            }
            snapshot.validate()?;
            Ok(LocalFile::Legacy(snapshot))
        }
        Value::Object(_) => {
            let snapshot: ReplicaSnapshot = serde_json::from_value(value)?;
            snapshot.validate()?;
            Ok(LocalFile::Snapshot(snapshot))
        }
        other => Err(Error::Decode(format!(
            "local replica is not an object: {}",
            kind(&other)
        ))),
    }
}

pub fn encode_local(snapshot: &ReplicaSnapshot) -> Result<Vec<u8>> {
    snapshot.validate()?;
    Ok(serde_json::to_vec_pretty(snapshot)?)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
