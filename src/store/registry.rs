// Copyright (c) 2026 Dignode
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Registry of local `.dig` stores.
//!
//! The on-disk name `<store-id>.dig` under the store directory is the
//! authoritative binding between file and store id. The filename is a
//! storage handle, not a cryptographic commitment: a store whose bytes do
//! not hash to its name is kept and flagged `content_verified = false`;
//! hash pinning only happens for URN requests that carry a root hash.
//!
//! Writers are the directory watcher and the download orchestrator;
//! everything else reads through cheap cloned snapshots (payloads are
//! behind `Arc`).

use crate::core::types::StoreId;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use ring::digest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Store directory missing and could not be created.
    #[error("store directory unavailable")]
    HomeUnavailable,
    /// File I/O failure for one entry.
    #[error("store io: {0}")]
    Io(String),
    /// Watcher could not be installed.
    #[error("directory watch failed")]
    Watch,
}

/// One local store.
#[derive(Clone)]
pub struct StoreEntry {
    /// Identity (filename stem).
    pub store_id: StoreId,
    /// Archive payload.
    pub bytes: Arc<Vec<u8>>,
    /// Payload length.
    pub size: u64,
    /// Filesystem birth time (best effort).
    pub created_at: SystemTime,
    /// SHA-256 of the payload.
    pub content_hash: [u8; 32],
    /// True iff the filename stem equals the payload hash.
    pub content_verified: bool,
}

impl StoreEntry {
    /// Hash as lowercase hex.
    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

/// Registry change events, consumed by the announcement layer.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// A store appeared or its bytes changed.
    Added(StoreId),
    /// A store left the directory.
    Removed(StoreId),
}

/// In-memory index of the store directory.
pub struct StoreRegistry {
    home: PathBuf,
    stores: RwLock<HashMap<StoreId, StoreEntry>>,
    events: broadcast::Sender<StoreEvent>,
}

impl StoreRegistry {
    /// Open the registry over `home`, creating the directory if needed.
    ///
    /// Fails only when the directory is missing and cannot be created; the
    /// caller degrades to a relay-only node in that case.
    pub fn open(home: impl Into<PathBuf>) -> Result<Arc<Self>, RegistryError> {
        let home = home.into();
        if !home.is_dir() {
            std::fs::create_dir_all(&home).map_err(|_| RegistryError::HomeUnavailable)?;
        }
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self { home, stores: RwLock::new(HashMap::new()), events }))
    }

    /// The store directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Subscribe to add/remove events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Scan the directory, replacing the in-memory index. Per-file errors
    /// are logged and skipped; the scan itself never fails.
    pub async fn scan(self: &Arc<Self>) {
        let mut found: HashMap<StoreId, StoreEntry> = HashMap::new();

        let mut dir = match tokio::fs::read_dir(&self.home).await {
            Ok(d) => d,
            Err(e) => {
                warn!(err = %e, dir = %self.home.display(), "store scan: cannot read directory");
                return;
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e != "dig").unwrap_or(true) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(store_id) = StoreId::new(stem) else {
                warn!(file = %path.display(), "ignoring .dig file with invalid store id");
                continue;
            };
            match load_entry(&path, store_id.clone()).await {
                Ok(entry) => {
                    found.insert(store_id, entry);
                }
                Err(e) => {
                    warn!(file = %path.display(), err = %e, "skipping unreadable store");
                }
            }
        }

        let mut map = self.stores.write().await;
        let removed: Vec<StoreId> =
            map.keys().filter(|id| !found.contains_key(id)).cloned().collect();
        let added: Vec<StoreId> = found
            .iter()
            .filter(|(id, e)| {
                map.get(id).map(|old| old.content_hash != e.content_hash).unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();
        *map = found;
        let count = map.len();
        drop(map);

        for id in removed {
            let _ = self.events.send(StoreEvent::Removed(id));
        }
        for id in added {
            let _ = self.events.send(StoreEvent::Added(id));
        }
        info!(stores = count, dir = %self.home.display(), "store scan complete");
    }

    /// Reload a single store from disk, e.g. after a watcher event or a
    /// finished download. Missing file drops the entry.
    pub async fn refresh(self: &Arc<Self>, store_id: &StoreId) {
        let path = self.home.join(store_id.file_name());
        if !path.is_file() {
            let removed = self.stores.write().await.remove(store_id).is_some();
            if removed {
                let _ = self.events.send(StoreEvent::Removed(store_id.clone()));
            }
            return;
        }
        match load_entry(&path, store_id.clone()).await {
            Ok(entry) => {
                self.stores.write().await.insert(store_id.clone(), entry);
                let _ = self.events.send(StoreEvent::Added(store_id.clone()));
            }
            Err(e) => {
                warn!(store = %store_id, err = %e, "refresh failed; dropping entry");
                let removed = self.stores.write().await.remove(store_id).is_some();
                if removed {
                    let _ = self.events.send(StoreEvent::Removed(store_id.clone()));
                }
            }
        }
    }

    /// Look up one store.
    pub async fn get(&self, store_id: &StoreId) -> Option<StoreEntry> {
        self.stores.read().await.get(store_id).cloned()
    }

    /// Whether the store is held locally.
    pub async fn contains(&self, store_id: &StoreId) -> bool {
        self.stores.read().await.contains_key(store_id)
    }

    /// All held store ids.
    pub async fn list_ids(&self) -> Vec<StoreId> {
        let mut ids: Vec<StoreId> = self.stores.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of held stores.
    pub async fn len(&self) -> usize {
        self.stores.read().await.len()
    }

    /// True when no stores are held.
    pub async fn is_empty(&self) -> bool {
        self.stores.read().await.is_empty()
    }

    /// Install a filesystem watcher over the store directory. Events are
    /// mapped to [`refresh`](Self::refresh) calls on the runtime.
    ///
    /// The returned watcher must be kept alive for the lifetime of the node.
    pub fn watch(self: &Arc<Self>) -> Result<notify::RecommendedWatcher, RegistryError> {
        let registry = Arc::clone(self);
        let handle = tokio::runtime::Handle::current();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(ev) => ev,
                Err(e) => {
                    debug!(err = %e, "watch error");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            for path in event.paths {
                let Some(id) = store_id_of(&path) else { continue };
                let registry = Arc::clone(&registry);
                handle.spawn(async move {
                    registry.refresh(&id).await;
                });
            }
        })
        .map_err(|_| RegistryError::Watch)?;

        watcher
            .watch(&self.home, RecursiveMode::NonRecursive)
            .map_err(|_| RegistryError::Watch)?;
        Ok(watcher)
    }
}

fn store_id_of(path: &Path) -> Option<StoreId> {
    if path.extension()? != "dig" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    StoreId::new(stem).ok()
}

async fn load_entry(path: &Path, store_id: StoreId) -> Result<StoreEntry, RegistryError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RegistryError::Io(e.to_string()))?;
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| RegistryError::Io(e.to_string()))?;
    let created_at = meta.created().or_else(|_| meta.modified()).unwrap_or(SystemTime::UNIX_EPOCH);

    let size = bytes.len() as u64;
    let bytes = Arc::new(bytes);
    let hash_input = Arc::clone(&bytes);
    // Hashing a large archive is CPU-bound; keep it off the reactor.
    let content_hash = tokio::task::spawn_blocking(move || sha256(&hash_input))
        .await
        .map_err(|e| RegistryError::Io(e.to_string()))?;

    let content_verified = hex::encode(content_hash) == store_id.as_str();
    if !content_verified {
        debug!(store = %store_id, "filename does not match content hash");
    }

    Ok(StoreEntry { store_id, bytes, size, created_at, content_hash, content_verified })
}

/// SHA-256 of a byte slice.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let d = digest::digest(&digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}
