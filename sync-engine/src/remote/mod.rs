//! Access to the networked realtime store.
//!
//! [`RemoteStore`] is the raw transport: a JSON tree addressed by slash
//! separated paths. [`RemoteReplica`] sits on top of it and speaks in
//! [`ReplicaSnapshot`](crate::model::ReplicaSnapshot)s for one user.

mod memory;
mod replica;
#[cfg(feature = "rest")]
mod rest;
mod sse;
pub mod tree;

pub use memory::MemoryRemote;
pub use replica::{RemoteReplica, Subscription};
#[cfg(feature = "rest")]
pub use rest::RestRemote;
pub use sse::{SseDecoder, SseEvent};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::Result;

/// Stream of full values observed at a listened path. `Value::Null` means the
/// path currently holds nothing.
pub type ValueStream = BoxStream<'static, Result<Value>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Point read. Absent paths read as `Value::Null`.
    async fn get(&self, path: &str) -> Result<Value>;

    /// Overwrites everything at `path`.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Writes each `relative path → value` pair under `path` as one change.
    /// `null` values delete.
    async fn update(&self, path: &str, updates: Map<String, Value>) -> Result<()>;

    /// Emits the current value at `path`, then the new value after every change.
    async fn listen(&self, path: &str) -> Result<ValueStream>;
}
