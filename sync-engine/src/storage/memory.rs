use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::LocalStore;
use crate::error::{Error, Result};
use crate::model::ReplicaSnapshot;

pub struct MemoryStore {
    snapshot: Mutex<ReplicaSnapshot>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_snapshot(ReplicaSnapshot::empty())
    }

    pub fn with_snapshot(snapshot: ReplicaSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            saves: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Makes subsequent saves fail with [`Error::LocalPersist`].
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load(&self) -> Result<ReplicaSnapshot> {
        Ok(self.snapshot())
    }

    async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::LocalPersist {
                path: "<memory>".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected save failure"),
            });
        }
        snapshot.validate()?;
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
