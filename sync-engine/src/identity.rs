//! Durable per-installation client identity.
//!
//! The id is written once on first run and read on every start afterwards.
//! Echo suppression compares remote `updatedBy` against it, so it must never be
//! regenerated silently: any storage failure is surfaced as
//! [`Error::IdentityUnavailable`].

use std::fmt;
use std::io::{self, ErrorKind};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    pub fn generate() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

/// Reads the client id stored at `path`, creating it on first use.
pub async fn load_or_create(path: &Path) -> Result<ClientId> {
    match read_existing(path).await {
        Ok(id) => {
            debug!(path = %path.display(), client_id = %id, "loaded client identity");
            return Ok(id);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(unavailable(path, e)),
    }

    let id = ClientId::generate();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|e| unavailable(path, e))?;
    }

    let created = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;

    match created {
        Ok(mut file) => {
            file.write_all(id.as_str().as_bytes())
                .await
                .map_err(|e| unavailable(path, e))?;
            file.sync_all().await.map_err(|e| unavailable(path, e))?;
            info!(path = %path.display(), client_id = %id, "created client identity");
            Ok(id)
        }
        // Another process won the first-run race; use its id.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            read_existing(path).await.map_err(|e| unavailable(path, e))
        }
        Err(e) => Err(unavailable(path, e)),
    }
}

async fn read_existing(path: &Path) -> io::Result<ClientId> {
    let raw = fs::read_to_string(path).await?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidData, "identity file is empty"));
    }
    Ok(ClientId::new(trimmed))
}

fn unavailable(path: &Path, e: io::Error) -> Error {
    Error::IdentityUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
