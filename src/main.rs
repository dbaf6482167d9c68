//! alias-bridge daemon
//!
//! Reconciles the local alias file with the user's remote document, keeps it
//! current from remote changes and regenerates the shell file, until Ctrl-C.
//!
//! Environment:
//! - `ALIAS_BRIDGE_USER`: id of the signed-in user (required)
//! - `ALIAS_BRIDGE_CONFIG`: config file path
//! - `ALIAS_BRIDGE_DATABASE_URL`, `ALIAS_BRIDGE_AUTH_TOKEN`: seed the sealed
//!   credential on first run
//! - `RUST_LOG`: log filter, `info` by default

use std::sync::Arc;

use alias_bridge::shell::ShellScriptWriter;
use anyhow::{bail, Context};
use sync_engine::credential;
use sync_engine::{
    identity, ClientId, JsonFileStore, MemoryRemote, RemoteBackend, RemoteReplica, RemoteStore, RestRemote,
    SealedCredentialFile, SyncConfig, SyncOrchestrator, SyncSession, SystemClock,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USER_VAR: &str = "ALIAS_BRIDGE_USER";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SyncConfig::load_or_default();
    let client_id = identity::load_or_create(&config.paths.client_id_file)
        .await
        .context("cannot establish client identity")?;
    let user_id = std::env::var(USER_VAR)
        .ok()
        .filter(|u| !u.trim().is_empty())
        .with_context(|| format!("{USER_VAR} is not set"))?;

    let remote = connect(&config, &client_id).await?;
    let session = Arc::new(SyncSession::new(user_id, config.environment, client_id, remote));
    let clock = Arc::new(SystemClock::new());
    let replica = RemoteReplica::new(Arc::clone(&session), clock.clone(), config.request_timeout());

    let sync = SyncOrchestrator::new(
        replica,
        JsonFileStore::new(&config.paths.data_file),
        clock,
        config.tie_break,
        Arc::new(ShellScriptWriter::new(&config.paths.shell_file)),
    );

    let mut ui = sync.subscribe_ui();
    tokio::spawn(async move {
        while ui.changed().await.is_ok() {
            let state = ui.borrow_and_update().clone();
            info!(status = ?state.status, aliases = state.aliases.len(), "sync status");
        }
    });

    info!(
        environment = %config.environment,
        data_file = %config.paths.data_file.display(),
        shell_file = %config.paths.shell_file.display(),
        "alias-bridge starting"
    );
    if let Err(e) = sync.start().await {
        warn!(error = %e, "initial sync failed, continuing with the local replica");
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    sync.stop();
    session.close();
    info!("alias-bridge stopped");
    Ok(())
}

async fn connect(config: &SyncConfig, client_id: &ClientId) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match config.remote.backend {
        RemoteBackend::Memory => {
            warn!("using the in-memory remote, changes stay in this process");
            Ok(Arc::new(MemoryRemote::new()))
        }
        RemoteBackend::Rest => {
            let store = SealedCredentialFile::new(&config.paths.credential_file, client_id.as_str());
            let stored = credential::ensure_credential(&store, |var| std::env::var(var).ok())
                .await
                .with_context(|| format!("cannot read credential at {}", store.path().display()))?;

            let (url, auth) = match (config.remote.database_url.clone(), stored) {
                (Some(url), stored) => (url, stored.and_then(|c| c.auth_token)),
                (None, Some(c)) => (c.database_url, c.auth_token),
                (None, None) => bail!(
                    "no database URL: set {} or remote.database_url in the config",
                    credential::DATABASE_URL_VAR
                ),
            };
            let remote = RestRemote::new(url, auth, config.request_timeout())?;
            Ok(Arc::new(remote))
        }
    }
}
