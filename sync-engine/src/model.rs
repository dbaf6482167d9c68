use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::{Error, Result};
use crate::identity::ClientId;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasId(String);

impl AliasId {
    pub fn new(id: impl Into<String>) -> Self {
        AliasId(id.into())
    }

    pub fn generate() -> Self {
        AliasId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids double as path segments in the remote document.
    pub fn is_valid_key(&self) -> bool {
        !self.0.is_empty()
            && !self
                .0
                .chars()
                .any(|c| matches!(c, '.' | '$' | '#' | '[' | ']' | '/') || c.is_control())
    }
}

impl fmt::Display for AliasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AliasId {
    fn from(s: &str) -> Self {
        AliasId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alias {
    pub id: AliasId,
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub created: Timestamp,
    #[serde(default)]
    pub last_updated: Timestamp,
}

impl Alias {
    pub fn from_draft(id: AliasId, draft: AliasDraft, now: Timestamp) -> Self {
        Self {
            id,
            name: draft.name,
            command: draft.command,
            comment: draft.comment,
            created: now,
            last_updated: now,
        }
    }

    /// Replaces the editable fields and bumps `last_updated`, keeping id and
    /// creation time.
    pub fn apply(&mut self, draft: AliasDraft, now: Timestamp) {
        self.name = draft.name;
        self.command = draft.command;
        self.comment = draft.comment;
        self.last_updated = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub id: AliasId,
    pub deleted_at: Timestamp,
}

/// User-editable part of an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasDraft {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl AliasDraft {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidAlias("name must not be empty".into()));
        }
        if let Some(c) = self
            .name
            .chars()
            .find(|c| c.is_whitespace() || matches!(c, '=' | '\'' | '"' | '/' | '$' | '`'))
        {
            return Err(Error::InvalidAlias(format!(
                "name {:?} contains forbidden character {c:?}",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidAlias(format!(
                "command for {:?} must not be empty",
                self.name
            )));
        }
        Ok(())
    }
}

/// The unit of state exchanged between the local file and the remote document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    #[serde(default)]
    pub aliases: BTreeMap<AliasId, Alias>,
    #[serde(default)]
    pub deleted: BTreeMap<AliasId, Tombstone>,
    #[serde(default)]
    pub updated_at: Timestamp,
    #[serde(default)]
    pub updated_by: ClientId,
}

impl ReplicaSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty() && self.deleted.is_empty()
    }

    /// Live aliases ordered by name, the way the UI and the shell file list them.
    pub fn live_aliases(&self) -> Vec<Alias> {
        let mut aliases: Vec<Alias> = self.aliases.values().cloned().collect();
        aliases.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        aliases
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Alias> {
        self.aliases.values().find(|a| a.name == name)
    }

    pub fn upsert(&mut self, alias: Alias) {
        self.deleted.remove(&alias.id);
        self.aliases.insert(alias.id.clone(), alias);
    }

    /// Moves `id` from `aliases` to `deleted`.
    pub fn bury(&mut self, id: &AliasId, at: Timestamp) -> Tombstone {
        self.aliases.remove(id);
        let tombstone = Tombstone {
            id: id.clone(),
            deleted_at: at,
        };
        self.deleted.insert(id.clone(), tombstone.clone());
        tombstone
    }

    pub fn touch(&mut self, at: Timestamp, by: &ClientId) {
        self.updated_at = self.updated_at.max(at);
        self.updated_by = by.clone();
    }

    /// Checks the structural rules a snapshot must satisfy before it is written
    /// anywhere: map keys match record ids and ids are usable as path keys.
    pub fn validate(&self) -> Result<()> {
        for (key, alias) in &self.aliases {
            if key != &alias.id {
                return Err(Error::Decode(format!(
                    "alias stored under {key} carries id {}",
                    alias.id
                )));
            }
            if !key.is_valid_key() {
                return Err(Error::Decode(format!("invalid alias id {key:?}")));
            }
            if alias.name.is_empty() {
                return Err(Error::Decode(format!("alias {key} has an empty name")));
            }
        }
        for (key, tombstone) in &self.deleted {
            if key != &tombstone.id {
                return Err(Error::Decode(format!(
                    "tombstone stored under {key} carries id {}",
                    tombstone.id
                )));
            }
            if !key.is_valid_key() {
                return Err(Error::Decode(format!("invalid tombstone id {key:?}")));
            }
        }
        Ok(())
    }
}
