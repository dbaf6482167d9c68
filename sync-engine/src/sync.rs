//! Orchestration of the local replica, the remote replica and their consumers.
//!
//! [`SyncOrchestrator::start`] reconciles both replicas once and then keeps the
//! local copy current from the remote listener. Local edits go through the
//! orchestrator so they are persisted, rendered and (once subscribed) pushed
//! as single-record patches.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::merge::{self, Stamp, TieBreakPolicy};
use crate::model::{Alias, AliasDraft, AliasId, ReplicaSnapshot, Tombstone};
use crate::remote::{RemoteReplica, Subscription};
use crate::storage::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Initializing,
    Syncing,
    Subscribed,
    Stopped,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Initializing => "initializing",
            SyncState::Syncing => "syncing",
            SyncState::Subscribed => "subscribed",
            SyncState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Coarse sync health shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Offline,
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiState {
    pub status: SyncStatus,
    pub aliases: Vec<Alias>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Offline,
            aliases: Vec::new(),
        }
    }
}

/// Derived outputs rebuilt from the live aliases after every local change,
/// e.g. the shell file that defines them.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn regenerate(&self, aliases: &[Alias]) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoArtifacts;

#[async_trait]
impl ArtifactSink for NoArtifacts {
    async fn regenerate(&self, _aliases: &[Alias]) -> Result<()> {
        Ok(())
    }
}

struct Shared<S> {
    replica: RemoteReplica,
    store: Mutex<S>,
    clock: Arc<dyn Clock>,
    policy: TieBreakPolicy,
    artifacts: Arc<dyn ArtifactSink>,
    ui: watch::Sender<UiState>,
    state: StdMutex<SyncState>,
    subscription: StdMutex<Option<Subscription>>,
}

impl<S: LocalStore + 'static> Shared<S> {
    fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SyncState) -> SyncState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut *state, next);
        if previous != next {
            debug!(from = %previous, to = %next, "sync state changed");
        }
        previous
    }

    /// Moves to `next` only from one of `from`. Returns whether it moved.
    fn transition(&self, from: &[SyncState], next: SyncState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !from.contains(&*state) {
            return false;
        }
        debug!(from = %*state, to = %next, "sync state changed");
        *state = next;
        true
    }

    /// Fails once `stop` has raced an in-flight start.
    fn ensure_starting(&self) -> Result<()> {
        match self.state() {
            SyncState::Initializing => Ok(()),
            other => Err(Error::InvalidState(format!("start abandoned, sync is {other}"))),
        }
    }

    fn take_subscription(&self) -> Option<Subscription> {
        self.subscription.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn set_status(&self, status: SyncStatus) {
        self.ui.send_modify(|ui| ui.status = status);
    }

    /// Renders artifacts and publishes the aliases. Artifact failures do not
    /// undo the persisted state.
    async fn publish(&self, snapshot: &ReplicaSnapshot, status: SyncStatus) {
        let aliases = snapshot.live_aliases();
        if let Err(e) = self.artifacts.regenerate(&aliases).await {
            warn!(error = %e, "failed to regenerate artifacts");
        }
        self.ui.send_replace(UiState { status, aliases });
    }

    async fn initialize(self: &Arc<Self>) -> Result<Subscription> {
        let store = self.store.lock().await;
        let (remote, local) = tokio::try_join!(self.replica.fetch(), store.load())?;
        self.ensure_starting()?;

        let stamp = Stamp {
            at: self.clock.now(),
            by: self.replica.session().client_id().clone(),
        };
        let outcome = merge::merge(&remote, &local, stamp, self.policy);
        info!(
            live = outcome.report.live,
            deleted = outcome.report.deleted,
            conflicts = outcome.report.conflicts,
            ties = outcome.report.ties,
            "merged local and remote replicas"
        );

        store.save(&outcome.snapshot).await?;
        self.ensure_starting()?;
        self.publish(&outcome.snapshot, SyncStatus::Ok).await;
        self.replica.push(&outcome.snapshot).await?;
        drop(store);

        if !self.transition(&[SyncState::Initializing], SyncState::Syncing) {
            return Err(Error::InvalidState(format!("start abandoned, sync is {}", self.state())));
        }
        let shared = Arc::clone(self);
        let ended = Arc::downgrade(self);
        self.replica
            .subscribe(
                move |snapshot| {
                    let shared = Arc::clone(&shared);
                    async move { shared.apply_remote(snapshot).await }
                },
                move || {
                    if let Some(shared) = ended.upgrade() {
                        shared.listener_ended();
                    }
                },
            )
            .await
    }

    /// The remote closed the listener. Live sync is over until the next
    /// `start`.
    fn listener_ended(&self) {
        if self.transition(&[SyncState::Syncing, SyncState::Subscribed], SyncState::Idle) {
            // The slot holds the handle of the task running this callback.
            drop(self.take_subscription());
            self.set_status(SyncStatus::Failed);
            warn!("live sync lost, restart to resume");
        }
    }

    async fn apply_remote(&self, snapshot: ReplicaSnapshot) {
        let store = self.store.lock().await;
        if let Err(e) = store.save(&snapshot).await {
            error!(error = %e, "failed to persist remote change");
            self.set_status(SyncStatus::Failed);
            return;
        }
        drop(store);
        info!(
            updated_by = %snapshot.updated_by,
            aliases = snapshot.aliases.len(),
            "applied remote change"
        );
        self.publish(&snapshot, SyncStatus::Ok).await;
    }

    /// Pushes one local record when live sync is attached. A failure leaves the
    /// local change in place; the next start reconciles it.
    async fn propagate(&self, change: Change<'_>) {
        if self.state() != SyncState::Subscribed {
            debug!("not subscribed, keeping change local");
            return;
        }
        let result = match change {
            Change::Upsert(alias) => self.replica.patch_alias(alias).await,
            Change::Delete(tombstone) => self.replica.patch_tombstone(tombstone).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to push local change");
            self.set_status(SyncStatus::Failed);
        }
    }
}

enum Change<'a> {
    Upsert(&'a Alias),
    Delete(&'a Tombstone),
}

/// Drives one user's sync lifecycle: `Idle → Initializing → Syncing →
/// Subscribed`, and `Stopped` once [`stop`](Self::stop) is called.
pub struct SyncOrchestrator<S: LocalStore + 'static> {
    shared: Arc<Shared<S>>,
}

impl<S: LocalStore + 'static> SyncOrchestrator<S> {
    pub fn new(
        replica: RemoteReplica,
        store: S,
        clock: Arc<dyn Clock>,
        policy: TieBreakPolicy,
        artifacts: Arc<dyn ArtifactSink>,
    ) -> Self {
        let (ui, _) = watch::channel(UiState::default());
        Self {
            shared: Arc::new(Shared {
                replica,
                store: Mutex::new(store),
                clock,
                policy,
                artifacts,
                ui,
                state: StdMutex::new(SyncState::Idle),
                subscription: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    pub fn subscribe_ui(&self) -> watch::Receiver<UiState> {
        self.shared.ui.subscribe()
    }

    /// Reconciles the replicas and attaches the remote listener.
    ///
    /// On failure the state returns to `Idle` and the error is returned; no
    /// retry is scheduled. Calling `start` again begins from scratch.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != SyncState::Idle {
                return Err(Error::InvalidState(format!("cannot start while {}", *state)));
            }
            *state = SyncState::Initializing;
        }
        info!(
            user_id = self.shared.replica.session().user_id(),
            client_id = %self.shared.replica.session().client_id(),
            "starting sync"
        );

        match self.shared.initialize().await {
            Ok(subscription) => {
                // Stored before the transition so `stop` and listener end can reach it.
                *self.shared.subscription.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);
                if self.shared.transition(&[SyncState::Syncing], SyncState::Subscribed) {
                    info!("sync running");
                    return Ok(());
                }
                drop(self.shared.take_subscription());
                match self.shared.state() {
                    SyncState::Stopped => Err(Error::InvalidState("stopped during start".into())),
                    _ => Err(Error::RemoteUnavailable("remote listener ended during start".into())),
                }
            }
            Err(e) => {
                if self
                    .shared
                    .transition(&[SyncState::Initializing, SyncState::Syncing], SyncState::Idle)
                {
                    error!(error = %e, "sync initialization failed");
                    self.shared.set_status(SyncStatus::Failed);
                } else {
                    // A publish may have landed after `stop` reported Offline.
                    self.shared.set_status(SyncStatus::Offline);
                    info!(error = %e, "start abandoned");
                }
                Err(e)
            }
        }
    }

    /// Detaches the listener. Safe to call any number of times.
    pub fn stop(&self) {
        let previous = self.shared.set_state(SyncState::Stopped);
        if let Some(mut subscription) = self.shared.take_subscription() {
            subscription.unsubscribe();
        }
        if previous != SyncState::Stopped {
            self.shared.set_status(SyncStatus::Offline);
            info!(from = %previous, "sync stopped");
        }
    }

    /// Live aliases ordered by name.
    pub async fn aliases(&self) -> Result<Vec<Alias>> {
        let store = self.shared.store.lock().await;
        Ok(store.load().await?.live_aliases())
    }

    pub async fn create_alias(&self, draft: AliasDraft) -> Result<Alias> {
        draft.validate()?;
        let store = self.shared.store.lock().await;
        let mut snapshot = store.load().await?;
        if snapshot.find_by_name(&draft.name).is_some() {
            return Err(Error::DuplicateName(draft.name));
        }

        let now = self.shared.clock.now();
        let alias = Alias::from_draft(AliasId::generate(), draft, now);
        snapshot.upsert(alias.clone());
        snapshot.touch(now, self.shared.replica.session().client_id());
        store.save(&snapshot).await?;
        info!(id = %alias.id, name = %alias.name, "alias created");

        self.shared.publish(&snapshot, self.status()).await;
        self.shared.propagate(Change::Upsert(&alias)).await;
        Ok(alias)
    }

    pub async fn update_alias(&self, id: &AliasId, draft: AliasDraft) -> Result<Alias> {
        draft.validate()?;
        let store = self.shared.store.lock().await;
        let mut snapshot = store.load().await?;
        if snapshot
            .find_by_name(&draft.name)
            .is_some_and(|other| &other.id != id)
        {
            return Err(Error::DuplicateName(draft.name));
        }

        let now = self.shared.clock.now();
        let alias = {
            let alias = snapshot
                .aliases
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(id.clone()))?;
            alias.apply(draft, now);
            alias.clone()
        };
        snapshot.touch(now, self.shared.replica.session().client_id());
        store.save(&snapshot).await?;
        info!(id = %alias.id, name = %alias.name, "alias updated");

        self.shared.publish(&snapshot, self.status()).await;
        self.shared.propagate(Change::Upsert(&alias)).await;
        Ok(alias)
    }

    pub async fn delete_alias(&self, id: &AliasId) -> Result<Tombstone> {
        let store = self.shared.store.lock().await;
        let mut snapshot = store.load().await?;
        if !snapshot.aliases.contains_key(id) {
            return Err(Error::NotFound(id.clone()));
        }

        let now = self.shared.clock.now();
        let tombstone = snapshot.bury(id, now);
        snapshot.touch(now, self.shared.replica.session().client_id());
        store.save(&snapshot).await?;
        info!(%id, "alias deleted");

        self.shared.publish(&snapshot, self.status()).await;
        self.shared.propagate(Change::Delete(&tombstone)).await;
        Ok(tombstone)
    }

    fn status(&self) -> SyncStatus {
        self.shared.ui.borrow().status
    }
}

impl<S: LocalStore + 'static> Drop for SyncOrchestrator<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::{json, Map, Value};
    use tokio::sync::oneshot;

    use super::*;
    use crate::clock::{ManualClock, Timestamp};
    use crate::identity::ClientId;
    use crate::remote::{MemoryRemote, RemoteStore, ValueStream};
    use crate::session::{Environment, SyncSession};
    use crate::storage::MemoryStore;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const DOC: &str = "dev_users/u1";

    #[derive(Default)]
    struct RecordingSink {
        renders: StdMutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ArtifactSink for RecordingSink {
        async fn regenerate(&self, aliases: &[Alias]) -> Result<()> {
            let names = aliases.iter().map(|a| a.name.clone()).collect();
            self.renders.lock().unwrap().push(names);
            Ok(())
        }
    }

    struct Client {
        orchestrator: SyncOrchestrator<Arc<MemoryStore>>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    }

    fn replica(remote: &MemoryRemote, client: &str, clock: &Arc<ManualClock>) -> RemoteReplica {
        let session = SyncSession::new("u1", Environment::Dev, ClientId::from(client), Arc::new(remote.clone()));
        RemoteReplica::new(Arc::new(session), clock.clone(), TIMEOUT)
    }

    fn client(remote: &MemoryRemote, id: &str, clock: &Arc<ManualClock>, local: ReplicaSnapshot) -> Client {
        let store = Arc::new(MemoryStore::with_snapshot(local));
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = SyncOrchestrator::new(
            replica(remote, id, clock),
            Arc::clone(&store),
            clock.clone(),
            TieBreakPolicy::default(),
            sink.clone(),
        );
        Client { orchestrator, store, sink }
    }

    fn alias(id: &str, name: &str, at: u64) -> Alias {
        Alias::from_draft(AliasId::from(id), AliasDraft::new(name, "echo"), Timestamp::from_millis(at))
    }

    fn remote_doc(remote: &MemoryRemote) -> ReplicaSnapshot {
        crate::codec::decode_remote(remote.value_at(DOC)).unwrap()
    }

    #[tokio::test]
    async fn newer_local_tombstone_beats_remote_edit() {
        let remote = MemoryRemote::new();
        remote
            .set(DOC, json!({
                "aliases": {"x": {"id": "x", "name": "gs", "command": "git status", "lastUpdated": 100}},
                "updatedAt": 100,
                "updatedBy": "other"
            }))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let mut local = ReplicaSnapshot::empty();
        local.bury(&AliasId::from("x"), Timestamp::from_millis(200));

        let c = client(&remote, "c1", &clock, local);
        c.orchestrator.start().await.unwrap();
        assert_eq!(c.orchestrator.state(), SyncState::Subscribed);

        let stored = c.store.snapshot();
        assert!(stored.aliases.is_empty());
        assert!(stored.deleted.contains_key(&AliasId::from("x")));

        let pushed = remote_doc(&remote);
        assert!(pushed.aliases.is_empty());
        assert_eq!(pushed.deleted[&AliasId::from("x")].deleted_at.as_millis(), 200);
        assert_eq!(pushed.updated_by.as_str(), "c1");
    }

    #[tokio::test]
    async fn newer_remote_edit_is_adopted_and_pushed_back() {
        let remote = MemoryRemote::new();
        let theirs = alias("x", "gs", 80);
        remote
            .set(DOC, json!({"aliases": {"x": theirs}, "updatedAt": 80, "updatedBy": "other"}))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let mut local = ReplicaSnapshot::empty();
        let mut mine = alias("x", "gst", 50);
        mine.command = "git stash".into();
        local.upsert(mine);

        let c = client(&remote, "c1", &clock, local);
        c.orchestrator.start().await.unwrap();

        assert_eq!(c.store.snapshot().aliases[&AliasId::from("x")], theirs);
        let pushed = remote_doc(&remote);
        assert_eq!(pushed.aliases[&AliasId::from("x")], theirs);
        assert_eq!(pushed.updated_by.as_str(), "c1");
        assert_eq!(pushed.updated_at.as_millis(), 1_000);

        let ui = c.orchestrator.subscribe_ui().borrow().clone();
        assert_eq!(ui.status, SyncStatus::Ok);
        assert_eq!(ui.aliases, vec![theirs]);
        assert_eq!(c.sink.renders.lock().unwrap().last().unwrap(), &vec!["gs".to_string()]);
    }

    #[tokio::test]
    async fn failed_start_returns_to_idle_without_touching_local() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let clock = Arc::new(ManualClock::new(10));
        let c = client(&remote, "c1", &clock, ReplicaSnapshot::empty());

        let err = c.orchestrator.start().await.unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
        assert_eq!(c.orchestrator.state(), SyncState::Idle);
        assert_eq!(c.store.save_count(), 0);
        assert_eq!(c.orchestrator.subscribe_ui().borrow().status, SyncStatus::Failed);

        remote.set_online(true);
        c.orchestrator.start().await.unwrap();
        assert_eq!(c.orchestrator.state(), SyncState::Subscribed);
    }

    #[tokio::test]
    async fn local_persist_failure_aborts_start() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let c = client(&remote, "c1", &clock, ReplicaSnapshot::empty());
        c.store.fail_saves(true);

        assert!(matches!(c.orchestrator.start().await, Err(Error::LocalPersist { .. })));
        assert_eq!(c.orchestrator.state(), SyncState::Idle);
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn remote_changes_from_other_clients_are_applied() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let c = client(&remote, "c1", &clock, ReplicaSnapshot::empty());
        c.orchestrator.start().await.unwrap();
        let mut ui = c.orchestrator.subscribe_ui();

        let mut theirs = ReplicaSnapshot::empty();
        theirs.upsert(alias("y", "ll", 20));
        replica(&remote, "c2", &clock).push(&theirs).await.unwrap();

        let state = tokio::time::timeout(TIMEOUT, ui.wait_for(|s| !s.aliases.is_empty()))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(state.aliases[0].name, "ll");
        assert!(c.store.snapshot().aliases.contains_key(&AliasId::from("y")));
    }

    #[tokio::test]
    async fn local_edits_propagate_between_clients() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let a = client(&remote, "a", &clock, ReplicaSnapshot::empty());
        let b = client(&remote, "b", &clock, ReplicaSnapshot::empty());
        a.orchestrator.start().await.unwrap();
        b.orchestrator.start().await.unwrap();
        let mut b_ui = b.orchestrator.subscribe_ui();

        clock.set(20);
        let created = a.orchestrator.create_alias(AliasDraft::new("ll", "ls -la")).await.unwrap();
        tokio::time::timeout(TIMEOUT, b_ui.wait_for(|s| s.aliases.iter().any(|x| x.id == created.id)))
            .await
            .unwrap()
            .unwrap();

        clock.set(30);
        a.orchestrator.delete_alias(&created.id).await.unwrap();
        tokio::time::timeout(TIMEOUT, b_ui.wait_for(|s| s.aliases.is_empty()))
            .await
            .unwrap()
            .unwrap();

        let stored = b.store.snapshot();
        assert_eq!(stored.deleted[&created.id].deleted_at.as_millis(), 30);
    }

    #[tokio::test]
    async fn local_mutations_enforce_names_and_existence() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let c = client(&remote, "c1", &clock, ReplicaSnapshot::empty());

        let ll = c.orchestrator.create_alias(AliasDraft::new("ll", "ls -l")).await.unwrap();
        let la = c.orchestrator.create_alias(AliasDraft::new("la", "ls -a")).await.unwrap();
        assert!(matches!(
            c.orchestrator.create_alias(AliasDraft::new("ll", "ls")).await,
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(
            c.orchestrator.update_alias(&la.id, AliasDraft::new("ll", "ls")).await,
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(
            c.orchestrator.create_alias(AliasDraft::new("bad name", "ls")).await,
            Err(Error::InvalidAlias(_))
        ));

        clock.set(50);
        let updated = c
            .orchestrator
            .update_alias(&ll.id, AliasDraft::new("ll", "ls -lh").with_comment("human sizes"))
            .await
            .unwrap();
        assert_eq!(updated.created.as_millis(), 10);
        assert_eq!(updated.last_updated.as_millis(), 50);

        c.orchestrator.delete_alias(&la.id).await.unwrap();
        assert!(matches!(c.orchestrator.delete_alias(&la.id).await, Err(Error::NotFound(_))));
        assert!(matches!(
            c.orchestrator.update_alias(&AliasId::from("nope"), AliasDraft::new("x", "y")).await,
            Err(Error::NotFound(_))
        ));

        let names: Vec<_> = c.orchestrator.aliases().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["ll"]);
        // Not started: nothing reached the remote.
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn offline_edit_is_kept_and_reported() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let c = client(&remote, "c1", &clock, ReplicaSnapshot::empty());
        c.orchestrator.start().await.unwrap();

        remote.set_online(false);
        c.orchestrator.create_alias(AliasDraft::new("ll", "ls")).await.unwrap();
        assert_eq!(c.store.snapshot().aliases.len(), 1);
        assert_eq!(c.orchestrator.subscribe_ui().borrow().status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let c = client(&remote, "c1", &clock, ReplicaSnapshot::empty());
        c.orchestrator.start().await.unwrap();

        c.orchestrator.stop();
        c.orchestrator.stop();
        assert_eq!(c.orchestrator.state(), SyncState::Stopped);
        assert_eq!(c.orchestrator.subscribe_ui().borrow().status, SyncStatus::Offline);
        assert!(matches!(c.orchestrator.start().await, Err(Error::InvalidState(_))));
    }

    /// Local store whose reads take long enough to race a `stop`.
    struct SlowStore(MemoryStore);

    #[async_trait]
    impl LocalStore for SlowStore {
        async fn load(&self) -> Result<ReplicaSnapshot> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.load().await
        }

        async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
            self.0.save(snapshot).await
        }
    }

    #[tokio::test]
    async fn stop_during_start_stays_stopped() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let orchestrator = SyncOrchestrator::new(
            replica(&remote, "c1", &clock),
            SlowStore(MemoryStore::new()),
            clock.clone(),
            TieBreakPolicy::default(),
            Arc::new(NoArtifacts),
        );

        let (started, ()) = tokio::join!(orchestrator.start(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            orchestrator.stop();
        });

        assert!(matches!(started, Err(Error::InvalidState(_))));
        assert_eq!(orchestrator.state(), SyncState::Stopped);
        assert_eq!(orchestrator.subscribe_ui().borrow().status, SyncStatus::Offline);
        assert_eq!(orchestrator.shared.store.lock().await.0.save_count(), 0);
        assert_eq!(remote.write_count(), 0);
    }

    /// Remote whose first listener closes once `cut` fires.
    struct EndingRemote {
        inner: MemoryRemote,
        cut: StdMutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl RemoteStore for EndingRemote {
        async fn get(&self, path: &str) -> Result<Value> {
            self.inner.get(path).await
        }

        async fn set(&self, path: &str, value: Value) -> Result<()> {
            self.inner.set(path, value).await
        }

        async fn update(&self, path: &str, updates: Map<String, Value>) -> Result<()> {
            self.inner.update(path, updates).await
        }

        async fn listen(&self, path: &str) -> Result<ValueStream> {
            let stream = self.inner.listen(path).await?;
            match self.cut.lock().unwrap().take() {
                Some(cut) => Ok(stream.take_until(cut).boxed()),
                None => Ok(stream),
            }
        }
    }

    #[tokio::test]
    async fn listener_end_marks_failed_and_allows_restart() {
        let remote = MemoryRemote::new();
        let (cut, cut_rx) = oneshot::channel();
        let ending = EndingRemote {
            inner: remote.clone(),
            cut: StdMutex::new(Some(cut_rx)),
        };
        let clock = Arc::new(ManualClock::new(10));
        let session = SyncSession::new("u1", Environment::Dev, ClientId::from("c1"), Arc::new(ending));
        let orchestrator = SyncOrchestrator::new(
            RemoteReplica::new(Arc::new(session), clock.clone(), TIMEOUT),
            MemoryStore::new(),
            clock.clone(),
            TieBreakPolicy::default(),
            Arc::new(NoArtifacts),
        );
        let mut ui = orchestrator.subscribe_ui();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state(), SyncState::Subscribed);

        cut.send(()).unwrap();
        tokio::time::timeout(TIMEOUT, ui.wait_for(|s| s.status == SyncStatus::Failed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(orchestrator.state(), SyncState::Idle);

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state(), SyncState::Subscribed);

        let mut theirs = ReplicaSnapshot::empty();
        theirs.upsert(alias("y", "ll", 20));
        replica(&remote, "c2", &clock).push(&theirs).await.unwrap();
        tokio::time::timeout(TIMEOUT, ui.wait_for(|s| s.aliases.iter().any(|a| a.name == "ll")))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn foreign_change_racing_own_edit_is_applied() {
        let remote = MemoryRemote::new();
        let clock = Arc::new(ManualClock::new(10));
        let c = client(&remote, "c1", &clock, ReplicaSnapshot::empty());
        c.orchestrator.start().await.unwrap();
        let mut ui = c.orchestrator.subscribe_ui();

        clock.set(20);
        let mut theirs = ReplicaSnapshot::empty();
        theirs.upsert(alias("y", "ll", 20));
        replica(&remote, "c2", &clock).push(&theirs).await.unwrap();
        c.orchestrator.create_alias(AliasDraft::new("gs", "git status")).await.unwrap();

        tokio::time::timeout(TIMEOUT, ui.wait_for(|s| s.aliases.iter().any(|a| a.name == "ll")))
            .await
            .unwrap()
            .unwrap();
        assert!(c.store.snapshot().aliases.contains_key(&AliasId::from("y")));
        let doc = remote_doc(&remote);
        assert!(doc.aliases.contains_key(&AliasId::from("y")));
        assert!(doc.aliases.values().any(|a| a.name == "gs"));
    }
}
