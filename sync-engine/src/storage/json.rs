use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use super::LocalStore;
use crate::codec::{self, LocalFile};
use crate::error::{Error, Result};
use crate::model::ReplicaSnapshot;

/// Local replica kept as one pretty-printed JSON file.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash never leaves a half-written replica behind.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "replica.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn persist_error(&self, source: std::io::Error) -> Error {
        Error::LocalPersist {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl LocalStore for JsonFileStore {
    async fn load(&self) -> Result<ReplicaSnapshot> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no local replica yet");
                return Ok(ReplicaSnapshot::empty());
            }
            Err(e) => return Err(self.persist_error(e)),
        };

        match codec::decode_local(&bytes) {
            Ok(LocalFile::Snapshot(snapshot)) => Ok(snapshot),
            Ok(LocalFile::Legacy(snapshot)) => {
                info!(
                    path = %self.path.display(),
                    aliases = snapshot.aliases.len(),
                    "read legacy alias list, will rewrite as snapshot on next save"
                );
                Ok(snapshot)
            }
            Err(e) => {
                let aside = self.sibling(".corrupt");
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "local replica unreadable, starting from empty"
                );
                fs::rename(&self.path, &aside)
                    .await
                    .map_err(|e| self.persist_error(e))?;
                Ok(ReplicaSnapshot::empty())
            }
        }
    }

    async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
        let bytes = codec::encode_local(snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.persist_error(e))?;
        }

        let tmp = self.sibling(".tmp");
        fs::write(&tmp, &bytes).await.map_err(|e| self.persist_error(e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.persist_error(e))?;

        debug!(
            path = %self.path.display(),
            aliases = snapshot.aliases.len(),
            deleted = snapshot.deleted.len(),
            "saved local replica"
        );
        Ok(())
    }
}
