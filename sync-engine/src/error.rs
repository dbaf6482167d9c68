use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::AliasId;

#[derive(Debug, Error)]
pub enum Error {
    /// The per-installation client id could not be read or created.
    #[error("client identity unavailable at {}: {reason}", path.display())]
    IdentityUnavailable { path: PathBuf, reason: String },

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote request timed out after {0:?}")]
    RemoteTimeout(Duration),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("failed to persist local replica to {}: {source}", path.display())]
    LocalPersist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("alias not found: {0}")]
    NotFound(AliasId),

    #[error("an alias named {0:?} already exists")]
    DuplicateName(String),

    #[error("invalid alias: {0}")]
    InvalidAlias(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// True for failures of the networked store, which leave local usage intact.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::RemoteTimeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

#[cfg(feature = "rest")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::RemoteUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
