use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::identity::ClientId;
use crate::remote::RemoteStore;

/// Deployment namespace of the remote documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl Environment {
    pub fn prefix(self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One signed-in user's connection to the remote store.
///
/// Everything that talks to the remote on the user's behalf borrows the
/// session; once [`close`](Self::close)d, it refuses to hand out document
/// paths and every remote operation fails with [`Error::RemoteUnavailable`].
pub struct SyncSession {
    user_id: String,
    environment: Environment,
    client_id: ClientId,
    remote: Arc<dyn RemoteStore>,
    closed: AtomicBool,
}

impl SyncSession {
    pub fn new(
        user_id: impl Into<String>,
        environment: Environment,
        client_id: ClientId,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            environment,
            client_id,
            remote,
            closed: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Path of the user's document, e.g. `dev_users/{uid}`.
    pub fn document_path(&self) -> Result<String> {
        if self.is_closed() {
            return Err(Error::RemoteUnavailable("session is closed".into()));
        }
        let uid = self.user_id.trim();
        if uid.is_empty() || uid.contains(['/', '.', '#', '$', '[', ']']) {
            return Err(Error::RemoteUnavailable(format!(
                "no usable user identity ({:?})",
                self.user_id
            )));
        }
        Ok(format!("{}_users/{}", self.environment.prefix(), uid))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(user_id = %self.user_id, "sync session closed");
        }
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("user_id", &self.user_id)
            .field("environment", &self.environment)
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
