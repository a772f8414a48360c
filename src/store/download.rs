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

//! Download orchestrator: acquire a store through a fixed cascade of
//! strategies, stopping at the first success.
//!
//! Order: direct stream, DHT lookup, gossip-discovered holders, peer TURN
//! relay, mesh routing, bootstrap TURN relay, bootstrap direct download.
//! Large stores (>= 1 MiB) with at least two live holders take the
//! parallel byte-range path: 256 KiB chunks, round-robin assignment,
//! at most four in flight, failed chunks retried on a different holder.
//! Partial downloads persist in a `.part` sidecar and resume across
//! restarts; a finished assembly is hashed before the registry adopts it.

use crate::core::error::AcquireError;
use crate::core::types::StoreId;
use crate::monitoring::metrics::Metrics;
use crate::networking::bootstrap::BootstrapClient;
use crate::networking::p2p::NetClient;
use crate::networking::peer_registry::{PeerInfo, PeerRegistry};
use crate::networking::privacy::{dig_store_key, DhtStoreRecord, PrivacyOverlay};
use crate::networking::protocol::{Request, Response};
use crate::store::partial::{chunk_bounds, chunk_count, PartialDownload, CHUNK_SIZE};
use crate::store::registry::{sha256, StoreRegistry};
use crate::core::addressing;
use libp2p::{Multiaddr, PeerId};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Parallel path threshold.
pub const PARALLEL_THRESHOLD: u64 = 1024 * 1024;
/// Concurrent chunk requests per store.
pub const MAX_INFLIGHT_CHUNKS: usize = 4;
/// Retries per chunk, each on a different holder.
pub const CHUNK_RETRIES: u32 = 2;

/// The cascade, in order. One uniform dispatch loop walks these variants;
/// each attempt reports success, not-applicable, or failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Live encrypted session with a known holder.
    Direct,
    /// Holders discovered through `/dig-store/<id>` records.
    Dht,
    /// Holders learned from the privacy overlay topics.
    Gossip,
    /// A `turn_relay`-capable peer fetches on our behalf.
    PeerTurn,
    /// Connected peers are asked for their known holders.
    Mesh,
    /// The bootstrap service relays the payload.
    BootstrapTurn,
    /// The bootstrap service hands out the holder's addresses directly.
    BootstrapDirect,
}

/// All strategies in cascade order.
pub const CASCADE: &[Strategy] = &[
    Strategy::Direct,
    Strategy::Dht,
    Strategy::Gossip,
    Strategy::PeerTurn,
    Strategy::Mesh,
    Strategy::BootstrapTurn,
    Strategy::BootstrapDirect,
];

enum Outcome {
    Success(Vec<u8>),
    NotApplicable,
    Failure,
}

/// A candidate source: peer id plus an optional dial hint. `resolved`
/// marks hints obtained through crypto-IPv6 resolution, which get strict
/// handshake verification on connect.
#[derive(Clone, Debug)]
struct Holder {
    peer: PeerId,
    addr: Option<Multiaddr>,
    resolved: bool,
}

/// Orchestrates acquisition of missing stores.
pub struct Downloader {
    client: NetClient,
    peers: Arc<PeerRegistry>,
    stores: Arc<StoreRegistry>,
    overlay: Arc<PrivacyOverlay>,
    bootstrap: Arc<BootstrapClient>,
    metrics: Arc<Metrics>,
    local_peer: PeerId,
    chunk_timeout: Duration,
}

impl Downloader {
    /// Assemble the orchestrator.
    pub fn new(
        client: NetClient,
        peers: Arc<PeerRegistry>,
        stores: Arc<StoreRegistry>,
        overlay: Arc<PrivacyOverlay>,
        bootstrap: Arc<BootstrapClient>,
        metrics: Arc<Metrics>,
        local_peer: PeerId,
        chunk_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            peers,
            stores,
            overlay,
            bootstrap,
            metrics,
            local_peer,
            chunk_timeout,
        })
    }

    /// Acquire one store. Returns the strategy that succeeded.
    pub async fn download(
        &self,
        store_id: &StoreId,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Strategy, AcquireError> {
        if self.stores.contains(store_id).await {
            return Ok(Strategy::Direct);
        }

        for &strategy in CASCADE {
            if *cancel.borrow() {
                return Err(AcquireError::DownloadFailed);
            }
            let outcome = match strategy {
                Strategy::Direct => self.try_direct(store_id, cancel).await,
                Strategy::Dht => self.try_dht(store_id, cancel).await,
                Strategy::Gossip => self.try_gossip(store_id, cancel).await,
                Strategy::PeerTurn => self.try_peer_turn(store_id).await,
                Strategy::Mesh => self.try_mesh(store_id, cancel).await,
                Strategy::BootstrapTurn => self.try_bootstrap_turn(store_id).await,
                Strategy::BootstrapDirect => self.try_bootstrap_direct(store_id, cancel).await,
            };

            match outcome {
                Outcome::Success(bytes) => {
                    self.commit(store_id, bytes).await?;
                    self.count_success(strategy);
                    info!(store = %store_id, ?strategy, "store downloaded");
                    return Ok(strategy);
                }
                Outcome::NotApplicable => {
                    debug!(store = %store_id, ?strategy, "strategy not applicable");
                }
                Outcome::Failure => {
                    debug!(store = %store_id, ?strategy, "strategy failed");
                }
            }
        }

        self.metrics.downloads_failed_total.inc();
        Err(AcquireError::DownloadFailed)
    }

    fn count_success(&self, strategy: Strategy) {
        match strategy {
            Strategy::Direct => self.metrics.downloads_via_direct.inc(),
            Strategy::Dht => self.metrics.downloads_via_dht.inc(),
            Strategy::Gossip => self.metrics.downloads_via_gossip.inc(),
            Strategy::PeerTurn => self.metrics.downloads_via_peer_turn.inc(),
            Strategy::Mesh => self.metrics.downloads_via_mesh.inc(),
            Strategy::BootstrapTurn => self.metrics.downloads_via_bootstrap_turn.inc(),
            Strategy::BootstrapDirect => self.metrics.downloads_via_bootstrap.inc(),
        }
    }

    // --- strategies -----------------------------------------------------

    async fn try_direct(&self, store_id: &StoreId, cancel: &watch::Receiver<bool>) -> Outcome {
        let connected = self.client.connected_peers().await;
        let holders: Vec<Holder> = self
            .peers
            .holders_of(store_id)
            .into_iter()
            .filter(|p| connected.contains(&p.peer_id))
            .map(|p| Holder { peer: p.peer_id, addr: None, resolved: false })
            .collect();
        if holders.is_empty() {
            return Outcome::NotApplicable;
        }
        self.fetch_from_holders(store_id, holders, cancel).await
    }

    async fn try_dht(&self, store_id: &StoreId, cancel: &watch::Receiver<bool>) -> Outcome {
        let values = self.client.get_record(dig_store_key(store_id)).await;
        if values.is_empty() {
            return Outcome::NotApplicable;
        }
        let mut holders = Vec::new();
        for value in values {
            let Ok(record) = serde_json::from_slice::<DhtStoreRecord>(&value) else { continue };
            let Ok(peer) = PeerId::from_str(&record.peer_id) else { continue };
            if peer == self.local_peer {
                continue;
            }
            let addr = self.resolve_holder_addr(&record.crypto_ipv6, &peer).await;
            let resolved = addr.is_some();
            holders.push(Holder { peer, addr, resolved });
        }
        if holders.is_empty() {
            return Outcome::NotApplicable;
        }
        self.fetch_from_holders(store_id, holders, cancel).await
    }

    async fn try_gossip(&self, store_id: &StoreId, cancel: &watch::Receiver<bool>) -> Outcome {
        // Everything the overlay has taught the peer registry, connected
        // or not; direct already covered the connected subset.
        let holders: Vec<Holder> = {
            let mut out = Vec::new();
            for info in self.peers.holders_of(store_id) {
                let addr = self.resolve_peer_addr(&info).await;
                let resolved = addr.is_some();
                out.push(Holder { peer: info.peer_id, addr, resolved });
            }
            out
        };
        if holders.is_empty() {
            return Outcome::NotApplicable;
        }
        self.fetch_from_holders(store_id, holders, cancel).await
    }

    async fn try_peer_turn(&self, store_id: &StoreId) -> Outcome {
        let relays = self
            .peers
            .list_by_capability(crate::core::types::Capability::TurnRelay);
        if relays.is_empty() {
            return Outcome::NotApplicable;
        }
        // The relay needs a source; hand it any holder we know of, or let
        // it serve from its own copy.
        let target = self
            .peers
            .holders_of(store_id)
            .first()
            .map(|p| p.peer_id)
            .unwrap_or(self.local_peer);

        for relay in relays {
            if relay.peer_id == self.local_peer {
                continue;
            }
            let req = Request::RelayRequest {
                store_id: store_id.to_string(),
                target_peer_id: target.to_base58(),
            };
            match self.client.request(relay.peer_id, req).await {
                Ok(resp) if resp.header.success && !resp.payload.is_empty() => {
                    return Outcome::Success(resp.payload);
                }
                Ok(_) | Err(_) => continue,
            }
        }
        Outcome::Failure
    }

    async fn try_mesh(&self, store_id: &StoreId, cancel: &watch::Receiver<bool>) -> Outcome {
        let connected = self.client.connected_peers().await;
        if connected.is_empty() {
            return Outcome::NotApplicable;
        }

        let mut holders: Vec<Holder> = Vec::new();
        for peer in connected {
            let req = Request::PrivacyPeerDiscovery {
                max_peers: 16,
                store_id: Some(store_id.to_string()),
            };
            let Ok(resp) = self.client.request(peer, req).await else { continue };
            let Some(entries) = resp.header.peers else { continue };
            for entry in entries {
                let Ok(candidate) = PeerId::from_str(&entry.peer_id) else { continue };
                if candidate == self.local_peer
                    || holders.iter().any(|h| h.peer == candidate)
                {
                    continue;
                }
                let addr = self.resolve_holder_addr(&entry.crypto_ipv6, &candidate).await;
                let resolved = addr.is_some();
                holders.push(Holder { peer: candidate, addr, resolved });
            }
        }
        if holders.is_empty() {
            return Outcome::Failure;
        }
        self.fetch_from_holders(store_id, holders, cancel).await
    }

    async fn try_bootstrap_turn(&self, store_id: &StoreId) -> Outcome {
        if !self.bootstrap.is_configured() {
            return Outcome::NotApplicable;
        }
        let target = self
            .peers
            .holders_of(store_id)
            .first()
            .map(|p| p.peer_id)
            .unwrap_or(self.local_peer);
        match self.bootstrap.turn_relay(store_id, &self.local_peer, &target).await {
            Ok(bytes) => Outcome::Success(bytes),
            Err(e) => {
                debug!(store = %store_id, err = %e, "bootstrap turn relay failed");
                Outcome::Failure
            }
        }
    }

    async fn try_bootstrap_direct(
        &self,
        store_id: &StoreId,
        cancel: &watch::Receiver<bool>,
    ) -> Outcome {
        if !self.bootstrap.is_configured() {
            return Outcome::NotApplicable;
        }
        let target = self
            .peers
            .holders_of(store_id)
            .first()
            .map(|p| p.peer_id)
            .unwrap_or(self.local_peer);
        let Ok(addresses) = self
            .bootstrap
            .turn_direct(store_id, &self.local_peer, &target)
            .await
        else {
            return Outcome::Failure;
        };

        let mut holders = Vec::new();
        for raw in addresses {
            let Ok(addr) = raw.parse::<Multiaddr>() else { continue };
            // A usable source address must name its peer. These addresses
            // come straight from the bootstrap service, not from
            // crypto-IPv6 resolution.
            let Some(peer) = peer_of(&addr) else { continue };
            if peer != self.local_peer {
                holders.push(Holder { peer, addr: Some(addr), resolved: false });
            }
        }
        if holders.is_empty() {
            return Outcome::Failure;
        }
        self.fetch_from_holders(store_id, holders, cancel).await
    }

    // --- transfer mechanics ---------------------------------------------

    /// Fetch from the given holders: probe the size, then either the
    /// parallel range path or a whole-store transfer.
    async fn fetch_from_holders(
        &self,
        store_id: &StoreId,
        holders: Vec<Holder>,
        cancel: &watch::Receiver<bool>,
    ) -> Outcome {
        // Probe with a one-byte range to learn the total size.
        let mut total_size = None;
        for holder in &holders {
            let req = Request::GetFileRange {
                store_id: store_id.to_string(),
                range_start: 0,
                range_end: 0,
                chunk_id: 0,
            };
            match self.request_holder(holder, req).await {
                Ok(resp) if resp.header.success => {
                    total_size = resp.header.total_size;
                    break;
                }
                _ => continue,
            }
        }

        if let Some(size) = total_size {
            if size >= PARALLEL_THRESHOLD && holders.len() >= 2 {
                match self.fetch_ranges(store_id, size, &holders, cancel).await {
                    Ok(bytes) => return Outcome::Success(bytes),
                    Err(e) => {
                        warn!(store = %store_id, err = %e, "parallel fetch failed");
                        // Fall through to whole-store attempts.
                    }
                }
            }
        }

        for holder in &holders {
            if *cancel.borrow() {
                return Outcome::Failure;
            }
            let req = Request::GetStoreContent { store_id: store_id.to_string() };
            match self.request_holder(holder, req).await {
                Ok(resp) if resp.header.success => return Outcome::Success(resp.payload),
                Ok(resp) => {
                    debug!(store = %store_id, peer = %holder.peer,
                        err = ?resp.header.error, "holder declined");
                }
                Err(e) => {
                    debug!(store = %store_id, peer = %holder.peer, err = %e, "holder unreachable");
                }
            }
        }
        Outcome::Failure
    }

    /// Parallel byte-range fetch with resume via the `.part` sidecar.
    async fn fetch_ranges(
        &self,
        store_id: &StoreId,
        total_size: u64,
        holders: &[Holder],
        cancel: &watch::Receiver<bool>,
    ) -> Result<Vec<u8>, AcquireError> {
        let part = PartialDownload::create_or_resume(
            self.stores.home(),
            store_id.clone(),
            total_size,
            CHUNK_SIZE,
        )
        .await
        .map_err(|_| AcquireError::DownloadFailed)?;

        let missing = part.missing_chunks();
        let total_chunks = chunk_count(total_size, CHUNK_SIZE);
        info!(
            store = %store_id,
            chunks = total_chunks,
            resume_from = total_chunks as usize - missing.len(),
            holders = holders.len(),
            "parallel range fetch"
        );

        let part = Arc::new(Mutex::new(part));
        let gate = Arc::new(Semaphore::new(MAX_INFLIGHT_CHUNKS));
        let mut tasks = Vec::new();

        for (slot, index) in missing.into_iter().enumerate() {
            let gate = Arc::clone(&gate);
            let part = Arc::clone(&part);
            let holders = holders.to_vec();
            let store_id = store_id.clone();
            let this = self.clone_handle();
            let cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire_owned().await.ok()?;
                if *cancel.borrow() {
                    return None;
                }
                let (start, end) = chunk_bounds(index, total_size, CHUNK_SIZE)?;

                // Round-robin by slot; retries move to the next holder.
                for attempt in 0..=CHUNK_RETRIES {
                    let holder = &holders[(slot + attempt as usize) % holders.len()];
                    let req = Request::GetFileRange {
                        store_id: store_id.to_string(),
                        range_start: start,
                        range_end: end,
                        chunk_id: index,
                    };
                    match this.request_holder(holder, req).await {
                        Ok(resp)
                            if resp.header.success
                                && resp.payload.len() as u64 == end - start + 1 =>
                        {
                            let mut part = part.lock().await;
                            if part.write_chunk(index, &resp.payload).await.is_ok() {
                                return Some(index);
                            }
                            return None;
                        }
                        Ok(_) | Err(_) => continue,
                    }
                }
                None
            }));
        }

        let mut completed = true;
        for task in tasks {
            match task.await {
                Ok(Some(_)) => {}
                _ => completed = false,
            }
        }

        let mut part = Arc::try_unwrap(part)
            .map_err(|_| AcquireError::DownloadFailed)?
            .into_inner();

        if !completed || !part.is_complete() {
            // Leave the sidecar for resume.
            debug!(store = %store_id, missing = part.missing_chunks().len(), "range fetch incomplete");
            return Err(AcquireError::DownloadFailed);
        }

        let bytes = part.read_payload().await.map_err(|_| AcquireError::DownloadFailed)?;
        // `commit` truncates the trailer away when it rewrites the sidecar.
        drop(part);
        Ok(bytes)
    }

    /// Write the assembled payload, hash it, and hand it to the registry.
    async fn commit(&self, store_id: &StoreId, bytes: Vec<u8>) -> Result<(), AcquireError> {
        let expected_len = bytes.len() as u64;
        let hash_input = bytes.clone();
        let content_hash = tokio::task::spawn_blocking(move || sha256(&hash_input))
            .await
            .map_err(|_| AcquireError::IntegrityFailure)?;

        let part_path = self.stores.home().join(store_id.part_file_name());
        let final_path = self.stores.home().join(store_id.file_name());

        tokio::fs::write(&part_path, &bytes)
            .await
            .map_err(|_| AcquireError::DownloadFailed)?;

        let written = tokio::fs::metadata(&part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if written != expected_len {
            self.metrics.integrity_failures_total.inc();
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(AcquireError::IntegrityFailure);
        }

        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(|_| AcquireError::DownloadFailed)?;

        debug!(store = %store_id, hash = %hex::encode(content_hash), "store committed");
        self.stores.refresh(store_id).await;
        Ok(())
    }

    // --- helpers --------------------------------------------------------

    async fn request_holder(&self, holder: &Holder, req: Request) -> Result<Response, AcquireError> {
        request_holder_with(&self.client, self.chunk_timeout, holder, req).await
    }

    async fn resolve_holder_addr(&self, crypto_ipv6: &str, peer: &PeerId) -> Option<Multiaddr> {
        let ipv6: std::net::Ipv6Addr = crypto_ipv6.parse().ok()?;
        let overlay_addr = addressing::format_overlay(ipv6, 0, peer);
        self.overlay.resolve(&overlay_addr).await.ok()?.into_iter().next()
    }

    async fn resolve_peer_addr(&self, info: &PeerInfo) -> Option<Multiaddr> {
        let overlay_addr =
            addressing::format_overlay(info.crypto_ipv6, info.server_port, &info.peer_id);
        self.overlay.resolve(&overlay_addr).await.ok()?.into_iter().next()
    }

    fn clone_handle(&self) -> DownloaderHandle {
        DownloaderHandle { client: self.client.clone(), chunk_timeout: self.chunk_timeout }
    }
}

/// Slim clone used by chunk worker tasks.
#[derive(Clone)]
struct DownloaderHandle {
    client: NetClient,
    chunk_timeout: Duration,
}

impl DownloaderHandle {
    async fn request_holder(&self, holder: &Holder, req: Request) -> Result<Response, AcquireError> {
        request_holder_with(&self.client, self.chunk_timeout, holder, req).await
    }
}

async fn request_holder_with(
    client: &NetClient,
    timeout: Duration,
    holder: &Holder,
    req: Request,
) -> Result<Response, AcquireError> {
    let fut = async {
        match (&holder.addr, holder.resolved) {
            // Addresses from crypto-IPv6 resolution demand strict
            // handshake verification on the dialed connection.
            (Some(addr), true) => client.request_resolved(holder.peer, addr.clone(), req).await,
            (Some(addr), false) => client.request_at(holder.peer, addr.clone(), req).await,
            (None, _) => client.request(holder.peer, req).await,
        }
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(_)) => Err(AcquireError::TransportClosed),
        Err(_) => Err(AcquireError::DialTimeout),
    }
}

fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(pid) => Some(pid),
        _ => None,
    })
}
