//! Offline-first synchronization of shell aliases between a local replica
//! and a realtime remote document, with per-record last-writer-wins merge and
//! tombstoned deletes.

pub mod clock;
pub mod codec;
pub mod config;
pub mod credential;
mod error;
pub mod identity;
pub mod merge;
pub mod model;
pub mod remote;
pub mod session;
pub mod storage;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{RemoteBackend, SyncConfig};
pub use credential::{CredentialStore, SealedCredentialFile, ServiceCredential};
pub use error::{Error, Result};
pub use identity::ClientId;
pub use merge::{merge, MergeOutcome, MergeReport, Stamp, TieBreakPolicy};
pub use model::{Alias, AliasDraft, AliasId, ReplicaSnapshot, Tombstone};
pub use remote::{MemoryRemote, RemoteReplica, RemoteStore, Subscription};
#[cfg(feature = "rest")]
pub use remote::RestRemote;
pub use session::{Environment, SyncSession};
pub use storage::{JsonFileStore, LocalStore, MemoryStore};
pub use sync::{ArtifactSink, NoArtifacts, SyncOrchestrator, SyncState, SyncStatus, UiState};
