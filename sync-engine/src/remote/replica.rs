use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec;
use crate::error::{Error, Result};
use crate::model::{Alias, ReplicaSnapshot, Tombstone};
use crate::session::SyncSession;

/// The remote copy of one user's alias state.
pub struct RemoteReplica {
    session: Arc<SyncSession>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RemoteReplica {
    pub fn new(session: Arc<SyncSession>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            session,
            clock,
            timeout,
        }
    }

    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::RemoteTimeout(self.timeout))?
    }

    /// Reads the user's document. A malformed document is logged and read as
    /// empty so the next push can repair it.
    pub async fn fetch(&self) -> Result<ReplicaSnapshot> {
        let path = self.session.document_path()?;
        let value = self.bounded(self.session.remote().get(&path)).await?;
        match codec::decode_remote(value) {
            Ok(snapshot) => {
                debug!(
                    path,
                    aliases = snapshot.aliases.len(),
                    deleted = snapshot.deleted.len(),
                    updated_by = %snapshot.updated_by,
                    "fetched remote replica"
                );
                Ok(snapshot)
            }
            Err(e) => {
                warn!(path, error = %e, "remote document malformed, treating as empty");
                Ok(ReplicaSnapshot::empty())
            }
        }
    }

    /// Overwrites the whole document. The snapshot must already be merged.
    pub async fn push(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
        let path = self.session.document_path()?;
        let mut outgoing = snapshot.clone();
        outgoing.updated_by = self.session.client_id().clone();
        outgoing.updated_at = self.clock.now();
        let value = codec::encode_remote(&outgoing)?;

        self.bounded(self.session.remote().set(&path, value)).await?;
        info!(
            path,
            aliases = outgoing.aliases.len(),
            deleted = outgoing.deleted.len(),
            "pushed replica"
        );
        Ok(())
    }

    pub async fn patch_alias(&self, alias: &Alias) -> Result<()> {
        if !alias.id.is_valid_key() {
            return Err(Error::Decode(format!("invalid alias id {:?}", alias.id)));
        }
        let mut updates = Map::new();
        updates.insert(format!("aliases/{}", alias.id), codec::encode_alias(alias)?);
        self.patch(updates).await?;
        debug!(id = %alias.id, name = %alias.name, "patched alias");
        Ok(())
    }

    /// Records a deletion and drops the live record in the same write.
    pub async fn patch_tombstone(&self, tombstone: &Tombstone) -> Result<()> {
        if !tombstone.id.is_valid_key() {
            return Err(Error::Decode(format!("invalid alias id {:?}", tombstone.id)));
        }
        let mut updates = Map::new();
        updates.insert(format!("deleted/{}", tombstone.id), serde_json::to_value(tombstone)?);
        updates.insert(format!("aliases/{}", tombstone.id), Value::Null);
        self.patch(updates).await?;
        debug!(id = %tombstone.id, "patched tombstone");
        Ok(())
    }

    async fn patch(&self, mut updates: Map<String, Value>) -> Result<()> {
        let path = self.session.document_path()?;
        updates.insert("updatedBy".into(), json!(self.session.client_id()));
        updates.insert("updatedAt".into(), json!(self.clock.now()));
        self.bounded(self.session.remote().update(&path, updates)).await
    }

    /// Calls `on_change` for every remote change made by another client.
    ///
    /// Changes stamped with this client's id are echoes of its own writes and
    /// are dropped. Callbacks run one at a time, in arrival order. `on_end`
    /// runs once if the remote closes the listener; it does not run after
    /// [`Subscription::unsubscribe`].
    pub async fn subscribe<F, Fut, E>(&self, on_change: F, on_end: E) -> Result<Subscription>
    where
        F: Fn(ReplicaSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let path = self.session.document_path()?;
        let mut stream = self.bounded(self.session.remote().listen(&path)).await?;
        let own_id = self.session.client_id().clone();
        let listened = path.clone();

        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let value = match item {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(path = %listened, error = %e, "remote listener error");
                        continue;
                    }
                };
                if value.is_null() {
                    debug!(path = %listened, "remote document absent, nothing to apply");
                    continue;
                }
                match codec::decode_remote(value) {
                    Ok(snapshot) if snapshot.updated_by == own_id => {
                        debug!(path = %listened, "suppressed echo of own write");
                    }
                    Ok(snapshot) => {
                        debug!(
                            path = %listened,
                            updated_by = %snapshot.updated_by,
                            aliases = snapshot.aliases.len(),
                            "remote change received"
                        );
                        on_change(snapshot).await;
                    }
                    Err(e) => warn!(path = %listened, error = %e, "ignoring undecodable remote change"),
                }
            }
            warn!(path = %listened, "remote listener ended");
            on_end();
        });

        info!(path, "subscribed to remote changes");
        Ok(Subscription { task: Some(task) })
    }
}

/// Handle to an attached change listener. Detaches on
/// [`unsubscribe`](Self::unsubscribe) or drop.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Detaches the listener. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("remote listener detached");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
