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

//! Store sync scheduler: discover peers, diff store sets, download what
//! is missing.
//!
//! One cycle at a time per node: concurrent ticks collapse against a
//! single-flight guard and return immediately. The guard clears on every
//! exit path. Downloads are sequential per store to bound memory; the
//! orchestrator parallelizes within a store.

use crate::core::types::StoreId;
use crate::monitoring::metrics::Metrics;
use crate::networking::bootstrap::BootstrapClient;
use crate::networking::p2p::NetClient;
use crate::networking::peer_registry::{PeerObservation, PeerRegistry};
use crate::networking::protocol::Request;
use crate::store::download::Downloader;
use crate::store::registry::StoreRegistry;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Result of one scheduler tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Cycle ran to completion.
    Completed {
        /// Stores that were missing at diff time.
        missing: usize,
        /// Stores acquired this cycle.
        downloaded: usize,
    },
    /// Another cycle was already in flight.
    AlreadyRunning,
    /// Nothing new observed since the previous cycle.
    Unchanged,
}

/// Periodic reconciliation loop.
pub struct SyncScheduler {
    client: NetClient,
    peers: Arc<PeerRegistry>,
    stores: Option<Arc<StoreRegistry>>,
    downloader: Option<Arc<Downloader>>,
    bootstrap: Arc<BootstrapClient>,
    metrics: Arc<Metrics>,
    interval: Duration,
    guard: Mutex<()>,
    last_revision: AtomicU64,
}

impl SyncScheduler {
    /// Assemble the scheduler. `stores`/`downloader` are `None` on a node
    /// without file access; such a node only refreshes its peer view.
    pub fn new(
        client: NetClient,
        peers: Arc<PeerRegistry>,
        stores: Option<Arc<StoreRegistry>>,
        downloader: Option<Arc<Downloader>>,
        bootstrap: Arc<BootstrapClient>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            peers,
            stores,
            downloader,
            bootstrap,
            metrics,
            interval,
            guard: Mutex::new(()),
            last_revision: AtomicU64::new(u64::MAX),
        })
    }

    /// Tick until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sync scheduler stopping");
                        return;
                    }
                }
            }
            self.sync_once(&shutdown).await;
        }
    }

    /// Run one cycle. Returns immediately when a cycle is already running.
    pub async fn sync_once(&self, cancel: &watch::Receiver<bool>) -> SyncOutcome {
        let Ok(_flight) = self.guard.try_lock() else {
            debug!("sync already in progress; skipping");
            return SyncOutcome::AlreadyRunning;
        };

        self.peers.expire(Instant::now());

        // Step 1: refresh store sets of reachable peers.
        let connected = self.client.connected_peers().await;
        if connected.is_empty() {
            // Step 4 (no peers): one bootstrap directory pull.
            match self.bootstrap.seed_registry(&self.peers).await {
                Ok(n) if n > 0 => info!(peers = n, "seeded registry from bootstrap directory"),
                Ok(_) => {}
                Err(e) => debug!(err = %e, "bootstrap pull failed"),
            }
        }
        for peer in &connected {
            match self.client.request(*peer, Request::ListStores).await {
                Ok(resp) if resp.header.success => {
                    let stores: BTreeSet<StoreId> = resp
                        .header
                        .stores
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|s| StoreId::new(s).ok())
                        .collect();
                    self.peers.upsert(
                        *peer,
                        PeerObservation { announced_stores: Some(stores), ..Default::default() },
                    );
                }
                Ok(_) => debug!(peer = %peer, "LIST_STORES declined"),
                Err(e) => debug!(peer = %peer, err = %e, "LIST_STORES failed"),
            }
        }

        // Debounce: if nothing changed since the last completed cycle
        // there is no new diff to compute.
        let revision = self.peers.revision();
        if revision == self.last_revision.load(Ordering::Relaxed) {
            self.metrics.sync_cycles_total.inc();
            return SyncOutcome::Unchanged;
        }

        // Step 2: diff.
        let (Some(stores), Some(downloader)) = (&self.stores, &self.downloader) else {
            self.last_revision.store(revision, Ordering::Relaxed);
            self.metrics.sync_cycles_total.inc();
            return SyncOutcome::Completed { missing: 0, downloaded: 0 };
        };
        let local: BTreeSet<StoreId> = stores.list_ids().await.into_iter().collect();
        let missing: Vec<StoreId> = self
            .peers
            .union_of_stores()
            .into_iter()
            .filter(|id| !local.contains(id))
            .collect();

        // Step 3: sequential downloads; one failure never blocks the rest.
        let mut downloaded = 0usize;
        let mut failed = 0usize;
        for id in &missing {
            if *cancel.borrow() {
                break;
            }
            match downloader.download(id, cancel).await {
                Ok(strategy) => {
                    downloaded += 1;
                    debug!(store = %id, ?strategy, "sync acquired store");
                }
                Err(e) => {
                    failed += 1;
                    warn!(store = %id, err = %e, "sync download failed");
                }
            }
        }

        self.last_revision.store(self.peers.revision(), Ordering::Relaxed);
        self.metrics.sync_cycles_total.inc();
        if !missing.is_empty() {
            info!(missing = missing.len(), downloaded, failed, "sync cycle complete");
        }
        SyncOutcome::Completed { missing: missing.len(), downloaded }
    }
}
