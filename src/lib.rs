//! alias-bridge: keeps shell aliases in sync across machines.
//!
//! The sync machinery lives in the `sync_engine` crate; this crate adds the
//! shell file the aliases are rendered into and the binaries.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use alias_bridge::shell::ShellScriptWriter;
//! use sync_engine::{
//!     AliasDraft, ClientId, Environment, JsonFileStore, MemoryRemote, RemoteReplica, SyncOrchestrator,
//!     SyncSession, SystemClock, TieBreakPolicy,
//! };
//!
//! # async fn run() -> sync_engine::Result<()> {
//! let session = SyncSession::new("u1", Environment::Dev, ClientId::generate(), Arc::new(MemoryRemote::new()));
//! let clock = Arc::new(SystemClock::new());
//! let replica = RemoteReplica::new(Arc::new(session), clock.clone(), Duration::from_secs(10));
//! let sync = SyncOrchestrator::new(
//!     replica,
//!     JsonFileStore::new("aliases.json"),
//!     clock,
//!     TieBreakPolicy::default(),
//!     Arc::new(ShellScriptWriter::new("aliases.sh")),
//! );
//! sync.start().await?;
//! sync.create_alias(AliasDraft::new("ll", "ls -la")).await?;
//! # Ok(())
//! # }
//! ```

pub mod shell;
