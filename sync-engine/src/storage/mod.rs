mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::ReplicaSnapshot;

/// Canonical local copy of the alias state.
///
/// Implementations read and write the snapshot as a whole; callers serialize
/// read-modify-write cycles themselves.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Returns the stored snapshot, or the empty snapshot if nothing was stored yet.
    async fn load(&self) -> Result<ReplicaSnapshot>;

    async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()>;
}

#[async_trait]
impl<T: LocalStore + ?Sized> LocalStore for std::sync::Arc<T> {
    async fn load(&self) -> Result<ReplicaSnapshot> {
        (**self).load().await
    }

    async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
        (**self).save(snapshot).await
    }
}
