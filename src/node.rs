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

//! Node lifecycle: ordered startup, capability negotiation, graceful
//! shutdown.
//!
//! Startup order: keys, store directory, transport, protocol handlers,
//! store scan, initial announces, sync scheduler, bootstrap registration.
//! Optional subsystems initialize under try/fallback wrappers: a failure
//! clears the matching capability bit and the node continues degraded
//! (a node without file access still relays and answers discovery).
//! Shutdown flips one watch channel; every loop exits at its next
//! suspension point, in-flight downloads leave their `.part` sidecars
//! intact, and the transport task stops last.

use crate::core::addressing;
use crate::core::config::NodeConfig;
use crate::core::session::SessionKeyring;
use crate::core::types::{Capability, NodeType};
use crate::monitoring::metrics::Metrics;
use crate::networking::bootstrap::{BootstrapClient, Registration};
use crate::networking::identity;
use crate::networking::p2p::{spawn_p2p, NetClient, P2pConfig, P2pEvent, StrictDials};
use crate::networking::peer_registry::{PeerObservation, PeerRegistry};
use crate::networking::privacy::PrivacyOverlay;
use crate::networking::protocol::Request;
use crate::networking::rate_limit::{RateLimitParams, RateLimiter};
use crate::networking::server::{LocalIdentity, ProtocolServer};
use crate::store::download::Downloader;
use crate::store::registry::StoreRegistry;
use crate::sync::scheduler::SyncScheduler;
use libp2p::PeerId;
use std::collections::BTreeSet;
use std::net::Ipv6Addr;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fatal startup failures (anything after the transport is bound degrades
/// instead of failing).
#[derive(Debug, Error)]
pub enum NodeError {
    /// Key material could not be loaded or created.
    #[error("identity unavailable")]
    Identity,
    /// The P2P task could not be spawned.
    #[error("transport start failed")]
    Transport,
    /// Metrics registry could not be built.
    #[error("metrics init failed")]
    Metrics,
}

/// A running node and its task handles.
pub struct Node {
    /// Effective configuration.
    pub config: NodeConfig,
    /// Transport peer id.
    pub peer_id: PeerId,
    /// Overlay address.
    pub crypto_ipv6: Ipv6Addr,
    /// Network handle.
    pub client: NetClient,
    /// Peer table.
    pub peers: Arc<PeerRegistry>,
    /// Store index, when the directory is available.
    pub stores: Option<Arc<StoreRegistry>>,
    /// Metrics.
    pub metrics: Arc<Metrics>,
    /// Capability set after negotiation.
    pub capabilities: Arc<RwLock<BTreeSet<Capability>>>,

    shutdown_tx: watch::Sender<bool>,
    p2p_handle: tokio::task::JoinHandle<()>,
    background: Vec<tokio::task::JoinHandle<()>>,
    // Dropped on shutdown; dropping stops the directory watch.
    _watcher: Option<notify::RecommendedWatcher>,
}

impl Node {
    /// Start a node. Fails only before the transport is bound.
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        let metrics = Arc::new(Metrics::new().map_err(|_| NodeError::Metrics)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // (b) keys: transport identity plus the overlay secret.
        let key_dir = config.dig_home.join(".keys");
        let (peer_id, id_keys) =
            identity::load_or_create_identity(&key_dir).map_err(|_| NodeError::Identity)?;
        let overlay_secret =
            identity::load_or_create_overlay_secret(&key_dir).map_err(|_| NodeError::Identity)?;
        let sessions = Arc::new(SessionKeyring::new(overlay_secret));
        let crypto_ipv6 = addressing::derive(&sessions.public_key());
        info!(%peer_id, %crypto_ipv6, network = %config.network_id, "node identity ready");

        // (c) store directory; failure degrades instead of aborting.
        let stores = match StoreRegistry::open(&config.dig_home) {
            Ok(reg) => Some(reg),
            Err(e) => {
                warn!(err = %e, dir = %config.dig_home.display(),
                    "store directory unavailable; running relay-only");
                None
            }
        };

        // Capability negotiation.
        let mut caps = BTreeSet::from([
            Capability::E2eEncryption,
            Capability::ByteRangeDownload,
            Capability::GossipDiscovery,
            Capability::MeshRouting,
            Capability::TurnRelay,
        ]);
        if stores.is_some() {
            caps.insert(Capability::StoreSync);
        }
        if config.enable_dht {
            caps.insert(Capability::DhtStorage);
        }
        let bootstrap = match BootstrapClient::new(config.bootstrap_servers.clone()) {
            Ok(c) => {
                if c.is_configured() {
                    caps.insert(Capability::BootstrapDiscovery);
                }
                c
            }
            Err(e) => {
                warn!(err = %e, "bootstrap client unavailable");
                BootstrapClient::new(Vec::new()).map_err(|_| NodeError::Transport)?
            }
        };
        let capabilities = Arc::new(RwLock::new(caps));

        let peers = Arc::new(PeerRegistry::new(peer_id, config.peer_ttl()));

        // (d)-(e) transport and protocol handlers.
        let local_identity = LocalIdentity {
            peer_id,
            crypto_ipv6,
            public_key_hex: hex::encode(sessions.public_key()),
            server_port: config.port,
            network_id: config.network_id.clone(),
            node_type: if stores.is_some() { NodeType::Full } else { NodeType::Relay },
        };
        let strict_dials = StrictDials::default();
        let server = ProtocolServer::new(
            local_identity,
            Arc::clone(&capabilities),
            stores.clone(),
            Arc::clone(&peers),
            Arc::clone(&sessions),
            RateLimiter::new(RateLimitParams { capacity: config.max_requests_per_minute }),
            strict_dials.clone(),
            Arc::clone(&metrics),
        );

        let p2p_cfg = P2pConfig {
            listen_addr: format!("/ip4/0.0.0.0/tcp/{}", config.port),
            connect_to_peers: config.connect_to_peers.clone(),
            enable_dht: config.enable_dht,
            request_timeout: config.chunk_timeout(),
            dial_timeout: config.dial_timeout(),
        };
        let (client, mut events, p2p_handle) = spawn_p2p(
            p2p_cfg,
            id_keys,
            Arc::clone(&server),
            strict_dials.clone(),
            Arc::clone(&metrics),
        )
        .map_err(|_| NodeError::Transport)?;
        server.set_relay(Arc::new(client.clone()));

        let overlay = PrivacyOverlay::new(
            client.clone(),
            peer_id,
            crypto_ipv6,
            config.port,
            Arc::clone(&sessions),
            Arc::clone(&peers),
            stores.clone(),
            Arc::clone(&capabilities),
            config.announce_jitter(),
        );

        let mut background = Vec::new();

        // (f) store scan and directory watch.
        let mut watcher = None;
        if let Some(reg) = &stores {
            reg.scan().await;
            metrics.store_count.set(reg.len().await as i64);
            match reg.watch() {
                Ok(w) => watcher = Some(w),
                Err(e) => warn!(err = %e, "store watch unavailable; rescans only"),
            }

            // Registry events feed re-announcement and the store gauge.
            let mut store_events = reg.subscribe();
            let overlay_ev = Arc::clone(&overlay);
            let reg_ev = Arc::clone(reg);
            let metrics_ev = Arc::clone(&metrics);
            let mut shutdown_ev = shutdown_rx.clone();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        ev = store_events.recv() => {
                            match ev {
                                Ok(ev) => {
                                    metrics_ev.store_count.set(reg_ev.len().await as i64);
                                    overlay_ev.on_store_event(&ev).await;
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(_) => return,
                            }
                        }
                        changed = shutdown_ev.changed() => {
                            if changed.is_err() || *shutdown_ev.borrow() { return; }
                        }
                    }
                }
            }));
        }

        // Event drain: handshakes on connect, gossip into the overlay.
        {
            let client_ev = client.clone();
            let server_ev = Arc::clone(&server);
            let sessions_ev = Arc::clone(&sessions);
            let peers_ev = Arc::clone(&peers);
            let overlay_ev = Arc::clone(&overlay);
            let metrics_ev = Arc::clone(&metrics);
            let strict_ev = strict_dials.clone();
            let mut shutdown_ev = shutdown_rx.clone();
            background.push(tokio::spawn(async move {
                loop {
                    let ev = tokio::select! {
                        maybe = events.recv() => match maybe {
                            Some(ev) => ev,
                            None => break,
                        },
                        changed = shutdown_ev.changed() => {
                            if changed.is_err() || *shutdown_ev.borrow() { return; }
                            continue;
                        }
                    };
                    match ev {
                        P2pEvent::PeerConnected(peer) => {
                            let client = client_ev.clone();
                            let server = Arc::clone(&server_ev);
                            let sessions = Arc::clone(&sessions_ev);
                            let peers = Arc::clone(&peers_ev);
                            let metrics = Arc::clone(&metrics_ev);
                            let strict = strict_ev.clone();
                            tokio::spawn(async move {
                                perform_handshake(
                                    client, server, sessions, peers, metrics, strict, peer,
                                )
                                .await;
                            });
                        }
                        P2pEvent::PeerDisconnected(_) => {}
                        P2pEvent::Gossip { .. } => {
                            overlay_ev.handle_gossip(&ev);
                        }
                        P2pEvent::Listening(addr) => {
                            overlay_ev.add_listen_addr(addr);
                        }
                    }
                }
                debug!("p2p event channel closed");
            }));
        }

        // (g) initial announces and bootstrap registration.
        overlay.announce_all().await;
        if bootstrap.is_configured() {
            let reg = Registration {
                peer_id,
                crypto_ipv6,
                overlay_addresses: vec![addressing::format_overlay(
                    crypto_ipv6,
                    config.port,
                    &peer_id,
                )
                .to_string()],
                real_addresses: Vec::new(),
                stores: match &stores {
                    Some(r) => r.list_ids().await,
                    None => Vec::new(),
                },
                capabilities: capabilities.read().expect("capability set lock poisoned").clone(),
                network_id: config.network_id.clone(),
            };
            if let Err(e) = bootstrap.register(&reg).await {
                debug!(err = %e, "bootstrap registration failed");
            }
        }

        // Announcer loop.
        background.push(tokio::spawn(
            Arc::clone(&overlay).run_announcer(shutdown_rx.clone()),
        ));

        // (h) sync scheduler.
        let downloader = stores.as_ref().map(|reg| {
            Downloader::new(
                client.clone(),
                Arc::clone(&peers),
                Arc::clone(reg),
                Arc::clone(&overlay),
                Arc::clone(&bootstrap),
                Arc::clone(&metrics),
                peer_id,
                config.chunk_timeout(),
            )
        });
        let scheduler = SyncScheduler::new(
            client.clone(),
            Arc::clone(&peers),
            stores.clone(),
            downloader,
            Arc::clone(&bootstrap),
            Arc::clone(&metrics),
            config.sync_interval(),
        );
        background.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

        // Metrics endpoint, when configured.
        if !config.metrics_addr.is_empty() {
            let addr = config.metrics_addr.clone();
            let metrics_srv = Arc::clone(&metrics);
            background.push(tokio::spawn(async move {
                if let Err(e) = crate::monitoring::metrics::serve(addr, metrics_srv).await {
                    warn!(err = %e, "metrics endpoint failed");
                }
            }));
        }

        Ok(Node {
            config,
            peer_id,
            crypto_ipv6,
            client,
            peers,
            stores,
            metrics,
            capabilities,
            shutdown_tx,
            p2p_handle,
            background,
            _watcher: watcher,
        })
    }

    /// Graceful shutdown: scheduler and announcer first, transport last.
    pub async fn shutdown(self) {
        info!("node shutting down");
        let _ = self.shutdown_tx.send(true);
        for handle in self.background {
            let _ = handle.await;
        }
        self.client.close().await;
        let _ = self.p2p_handle.await;
        info!("node stopped");
    }
}

/// Client side of the symmetric handshake, run once per new connection.
#[allow(clippy::too_many_arguments)]
async fn perform_handshake(
    client: NetClient,
    server: Arc<ProtocolServer>,
    sessions: Arc<SessionKeyring>,
    peers: Arc<PeerRegistry>,
    metrics: Arc<Metrics>,
    strict_dials: StrictDials,
    peer: PeerId,
) {
    let ours = server.local_handshake().await;
    let resp = match client.request(peer, Request::Handshake(Box::new(ours))).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(%peer, err = %e, "handshake request failed");
            return;
        }
    };
    if !resp.header.success {
        debug!(%peer, err = ?resp.header.error, "handshake rejected");
        return;
    }
    let Some(theirs) = resp.header.handshake else {
        debug!(%peer, "handshake response missing body");
        return;
    };

    let Ok(public_key) = hex::decode(&theirs.public_key) else { return };
    let Ok(advertised) = theirs.crypto_ipv6.parse::<Ipv6Addr>() else { return };
    let verified = addressing::derive(&public_key) == advertised;
    if !verified {
        metrics.handshake_unverified_total.inc();
        // Strict path: this connection exists because we resolved the
        // peer's crypto-IPv6 to an address, so a key that does not hash
        // to that address invalidates the whole connection.
        if strict_dials.contains(&peer) {
            warn!(%peer, "resolved-address handshake failed verification; disconnecting");
            sessions.forget(&peer);
            peers.remove(&peer);
            client.disconnect(peer).await;
            return;
        }
        warn!(%peer, "handshake response key does not hash to advertised crypto-IPv6");
    }
    if sessions.establish(peer, &public_key).is_err() {
        return;
    }

    let stores = theirs
        .stores
        .iter()
        .filter_map(|s| crate::core::types::StoreId::new(s).ok())
        .collect();
    peers.upsert(
        peer,
        PeerObservation {
            crypto_ipv6: Some(advertised),
            capabilities: Some(theirs.known_capabilities()),
            announced_stores: Some(stores),
            protocol_version: Some(theirs.protocol_version),
            server_port: Some(theirs.server_port),
            encrypted_addresses: None,
            verified: Some(verified),
        },
    );
    info!(%peer, verified, features = ?resp.header.compatible_features, "handshake established");
}
