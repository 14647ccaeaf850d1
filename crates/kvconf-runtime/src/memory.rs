//! In-process key/value store.
//!
//! [`MemoryKv`] keeps entries in an ordered map and broadcasts the key of
//! every write. It plugs into [`KvBackend`] like any remote store, which makes
//! it useful for embedding and as a test double.
//!
//! ```rust,ignore
//! let kv = MemoryKv::new();
//! let store = ConfigStore::new();
//! store.add_backend("memory", kv.backend());
//! store.init(Options::new().url("memory://local/app/config")?.default_config(cfg)).await?;
//!
//! kv.put("/app/config", r#"{"Addr":":8080"}"#);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kvconf_core::{BackendResult, Kv, KvClient, KvConnector, Location};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::remote::KvBackend;

const CHANGE_CAPACITY: usize = 64;

struct Inner {
    entries: RwLock<BTreeMap<String, String>>,
    changes: broadcast::Sender<String>,
}

/// Returns `true` if a change of `changed` concerns a read or watch of `key`.
fn covers(key: &str, changed: &str) -> bool {
    if key.ends_with('/') {
        changed.starts_with(key)
    } else {
        changed == key
    }
}

/// A flat key/value store living in the process.
///
/// Clones share the same entries.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                changes,
            }),
        }
    }

    /// Writes an entry and notifies watchers.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.inner.entries.write().insert(key.clone(), value.into());
        // Nobody listening is fine.
        let _ = self.inner.changes.send(key);
    }

    /// Removes an entry, notifying watchers if it existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.entries.write().remove(key).is_some();
        if removed {
            let _ = self.inner.changes.send(key.to_string());
        }
        removed
    }

    /// Returns all entries ordered by key.
    pub fn entries(&self) -> Vec<Kv> {
        self.inner
            .entries
            .read()
            .iter()
            .map(|(k, v)| Kv::new(k.clone(), v.clone()))
            .collect()
    }

    /// Creates a backend serving configuration from this store.
    pub fn backend(&self) -> KvBackend<MemoryKv> {
        KvBackend::new(self.clone())
    }
}

#[async_trait]
impl KvConnector for MemoryKv {
    type Client = MemoryKv;

    async fn connect(&self, _location: &Location, _timeout: Duration) -> BackendResult<MemoryKv> {
        Ok(self.clone())
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> BackendResult<Vec<Kv>> {
        let entries = self.inner.entries.read();
        let kvs = if key.ends_with('/') {
            entries
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, v)| Kv::new(k.clone(), v.clone()))
                .collect()
        } else {
            entries
                .get(key)
                .map(|v| vec![Kv::new(key, v.clone())])
                .unwrap_or_default()
        };
        Ok(kvs)
    }

    async fn put(&self, kv: &Kv) -> BackendResult<()> {
        MemoryKv::put(self, kv.key.clone(), kv.value.clone());
        Ok(())
    }

    async fn watch(&self, key: &str) -> BackendResult<BoxStream<'static, BackendResult<()>>> {
        let rx = self.inner.changes.subscribe();
        let key = key.to_string();
        let stream = futures::stream::unfold((rx, key), |(mut rx, key)| async move {
            loop {
                match rx.recv().await {
                    Ok(changed) if covers(&key, &changed) => return Some((Ok(()), (rx, key))),
                    Ok(_) => continue,
                    // Missed notifications may have included ours.
                    Err(RecvError::Lagged(_)) => return Some((Ok(()), (rx, key))),
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
