//! Two clients of one account syncing through an in-process remote.
//!
//! Walks through offline edits, a delete racing an older edit, and live
//! propagation, then prints the remote document both clients converged on.
//!
//! Usage: `sync_demo` (set `RUST_LOG=debug` to see echo suppression)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use sync_engine::{
    AliasDraft, ClientId, Environment, ManualClock, MemoryRemote, MemoryStore, NoArtifacts, RemoteReplica,
    SyncOrchestrator, SyncSession, TieBreakPolicy, UiState,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(2);

struct Peer {
    name: &'static str,
    sync: SyncOrchestrator<MemoryStore>,
    ui: watch::Receiver<UiState>,
}

impl Peer {
    fn new(name: &'static str, remote: &MemoryRemote, clock: &Arc<ManualClock>) -> Self {
        let session = SyncSession::new("demo-user", Environment::Dev, ClientId::from(name), Arc::new(remote.clone()));
        let replica = RemoteReplica::new(Arc::new(session), clock.clone(), TIMEOUT);
        let sync = SyncOrchestrator::new(
            replica,
            MemoryStore::new(),
            clock.clone(),
            TieBreakPolicy::default(),
            Arc::new(NoArtifacts),
        );
        let ui = sync.subscribe_ui();
        Self { name, sync, ui }
    }

    async fn wait_for(&mut self, what: &str, pred: impl FnMut(&UiState) -> bool) -> anyhow::Result<()> {
        tokio::time::timeout(TIMEOUT, self.ui.wait_for(pred))
            .await
            .with_context(|| format!("{} never saw {what}", self.name))?
            .context("orchestrator dropped")?;
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.ui.borrow().aliases.iter().map(|a| a.name.clone()).collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let remote = MemoryRemote::new();
    let clock = Arc::new(ManualClock::new(1_000));
    let mut laptop = Peer::new("laptop", &remote, &clock);
    let mut desktop = Peer::new("desktop", &remote, &clock);

    println!("== offline edits ==");
    let gs = laptop.sync.create_alias(AliasDraft::new("gs", "git status")).await?;
    clock.advance(10);
    desktop.sync.create_alias(AliasDraft::new("ll", "ls -la")).await?;
    println!("laptop:  {:?}", laptop.names());
    println!("desktop: {:?}", desktop.names());

    println!("== first sync ==");
    laptop.sync.start().await?;
    desktop.sync.start().await?;
    laptop.wait_for("desktop's aliases", |s| s.aliases.len() == 2).await?;
    println!("laptop:  {:?}", laptop.names());
    println!("desktop: {:?}", desktop.names());

    println!("== live edit and delete ==");
    clock.advance(10);
    desktop
        .sync
        .update_alias(&gs.id, AliasDraft::new("gs", "git status -sb").with_comment("short branch view"))
        .await?;
    laptop
        .wait_for("the edit", |s| s.aliases.iter().any(|a| a.command == "git status -sb"))
        .await?;
    clock.advance(10);
    laptop.sync.delete_alias(&gs.id).await?;
    desktop.wait_for("the delete", |s| s.aliases.len() == 1).await?;
    println!("laptop:  {:?}", laptop.names());
    println!("desktop: {:?}", desktop.names());

    ensure!(laptop.names() == desktop.names(), "clients diverged");

    laptop.sync.stop();
    desktop.sync.stop();

    println!("== remote document ==");
    let doc = remote.value_at("dev_users/demo-user");
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
