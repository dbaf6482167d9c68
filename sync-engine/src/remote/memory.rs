use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{tree, RemoteStore, ValueStream};
use crate::error::{Error, Result};

const CHANGE_BUFFER: usize = 256;

/// In-process realtime store. Clones share the same tree, so several clients
/// in one process see each other's writes like they would through the hosted
/// service.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

/// A committed write: the path written and the whole tree right after it.
#[derive(Clone)]
struct Change {
    path: String,
    tree: Arc<Value>,
}

struct Inner {
    tree: Mutex<Value>,
    changes: broadcast::Sender<Change>,
    online: AtomicBool,
    stalled: AtomicBool,
    writes: AtomicUsize,
}

impl Inner {
    fn read(&self, path: &str) -> Value {
        let tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
        tree::get(&tree, path).cloned().unwrap_or(Value::Null)
    }

    /// Applies a write and publishes the resulting tree while still holding
    /// the lock, so listeners see every write in commit order.
    fn write(&self, path: &str, apply: impl FnOnce(&mut Value)) {
        let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut tree);
        self.writes.fetch_add(1, Ordering::SeqCst);
        let change = Change {
            path: path.to_string(),
            tree: Arc::new(tree.clone()),
        };
        // No receivers just means nobody is listening.
        let _ = self.changes.send(change);
    }

    /// Subscribes and reads the current value atomically with respect to
    /// writes.
    fn watch(&self, path: &str) -> (broadcast::Receiver<Change>, Value) {
        let tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.changes.subscribe();
        let current = tree::get(&tree, path).cloned().unwrap_or(Value::Null);
        (rx, current)
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Value::Null),
                changes,
                online: AtomicBool::new(true),
                stalled: AtomicBool::new(false),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// While offline every request fails with [`Error::RemoteUnavailable`].
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// While stalled every request hangs, as with an unresponsive backend.
    pub fn stall(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn value_at(&self, path: &str) -> Value {
        self.inner.read(path)
    }

    async fn check(&self) -> Result<()> {
        if self.inner.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnavailable("memory remote is offline".into()));
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

struct Listener {
    inner: Arc<Inner>,
    path: String,
    rx: broadcast::Receiver<Change>,
    initial: Option<Value>,
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, path: &str) -> Result<Value> {
        self.check().await?;
        Ok(self.inner.read(path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.check().await?;
        self.inner.write(path, |root| tree::set(root, path, value));
        Ok(())
    }

    async fn update(&self, path: &str, updates: Map<String, Value>) -> Result<()> {
        self.check().await?;
        self.inner.write(path, |root| tree::update(root, path, updates));
        Ok(())
    }

    async fn listen(&self, path: &str) -> Result<ValueStream> {
        self.check().await?;
        let (rx, current) = self.inner.watch(path);
        let listener = Listener {
            inner: Arc::clone(&self.inner),
            path: path.to_string(),
            initial: Some(current),
            rx,
        };

        let stream = futures::stream::unfold(listener, |mut l| async move {
            if let Some(value) = l.initial.take() {
                return Some((Ok(value), l));
            }
            loop {
                match l.rx.recv().await {
                    Ok(change) if tree::overlaps(&change.path, &l.path) => {
                        let value = tree::get(&change.tree, &l.path).cloned().unwrap_or(Value::Null);
                        return Some((Ok(value), l));
                    }
                    Ok(_) => continue,
                    // Missed notifications collapse into the current value.
                    Err(RecvError::Lagged(_)) => {
                        let value = l.inner.read(&l.path);
                        return Some((Ok(value), l));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
