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

//! Server-side dispatch of `/dig/1.0.0` requests.
//!
//! Every inbound envelope passes the per-peer token bucket first; an
//! over-quota request is answered with silence (the response channel is
//! dropped, closing the stream). Validation precedes dispatch: store ids,
//! URNs and resource paths are checked before any registry access.

use crate::core::addressing;
use crate::core::error::RequestError;
use crate::core::session::SessionKeyring;
use crate::core::types::{
    is_valid_store_id, Capability, DigUrn, NodeType, StoreId, DIG_MIME_TYPE, PROTOCOL_VERSION,
};
use crate::monitoring::metrics::Metrics;
use crate::networking::p2p::StrictDials;
use crate::networking::peer_registry::{PeerObservation, PeerRegistry};
use crate::networking::protocol::{
    parse_request, HandshakeInfo, ParseFailure, PeerExchangeEntry, Request, RequestEnvelope,
    Response, ResponseHeader,
};
use crate::networking::rate_limit::{Admission, RateLimiter};
use crate::store::registry::StoreRegistry;
use libp2p::PeerId;
use std::collections::BTreeSet;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Fetches a store from a third peer on behalf of a relay request.
#[async_trait::async_trait]
pub trait RelayFetch: Send + Sync {
    /// Fetch the full store payload from `target`.
    async fn fetch_store(&self, target: PeerId, store_id: StoreId) -> Option<Vec<u8>>;
}

/// Immutable facts about the local node, baked into handshake responses.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    /// Transport peer id.
    pub peer_id: PeerId,
    /// Overlay address derived from `public_key`.
    pub crypto_ipv6: Ipv6Addr,
    /// Overlay public key, hex.
    pub public_key_hex: String,
    /// Listen port advertised to peers.
    pub server_port: u16,
    /// Network identifier.
    pub network_id: String,
    /// Role announced in handshakes.
    pub node_type: NodeType,
}

/// Feature strings this build understands.
pub const SUPPORTED_FEATURES: &[&str] =
    &["byte_range", "privacy_overlay", "dht_resolution", "peer_relay"];

/// Handles one request at a time; shared across the swarm loop and the
/// tasks it spawns.
pub struct ProtocolServer {
    identity: LocalIdentity,
    capabilities: Arc<RwLock<BTreeSet<Capability>>>,
    stores: Option<Arc<StoreRegistry>>,
    peers: Arc<PeerRegistry>,
    sessions: Arc<SessionKeyring>,
    limiter: Mutex<RateLimiter>,
    strict_dials: StrictDials,
    metrics: Arc<Metrics>,
    relay: OnceLock<Arc<dyn RelayFetch>>,
}

impl ProtocolServer {
    /// Build a server. `stores` is `None` when the store directory is
    /// unavailable and the node serves as a relay-only participant.
    pub fn new(
        identity: LocalIdentity,
        capabilities: Arc<RwLock<BTreeSet<Capability>>>,
        stores: Option<Arc<StoreRegistry>>,
        peers: Arc<PeerRegistry>,
        sessions: Arc<SessionKeyring>,
        limiter: RateLimiter,
        strict_dials: StrictDials,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            capabilities,
            stores,
            peers,
            sessions,
            limiter: Mutex::new(limiter),
            strict_dials,
            metrics,
            relay: OnceLock::new(),
        })
    }

    /// Install the relay fetcher once the network client exists.
    pub fn set_relay(&self, relay: Arc<dyn RelayFetch>) {
        let _ = self.relay.set(relay);
    }

    /// The handshake body this node sends and answers with.
    pub async fn local_handshake(&self) -> HandshakeInfo {
        let stores = match &self.stores {
            Some(reg) => reg.list_ids().await.iter().map(|s| s.to_string()).collect(),
            None => Vec::new(),
        };
        let capabilities = self
            .capabilities
            .read()
            .expect("capability set lock poisoned")
            .iter()
            .map(|c| (capability_code(*c), c.description().to_string()))
            .collect();
        HandshakeInfo {
            network_id: self.identity.network_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            server_port: self.identity.server_port,
            node_type: self.identity.node_type,
            capabilities,
            peer_id: self.identity.peer_id.to_base58(),
            crypto_ipv6: self.identity.crypto_ipv6.to_string(),
            public_key: self.identity.public_key_hex.clone(),
            timestamp: unix_ms(),
            stores,
            supported_features: SUPPORTED_FEATURES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Dispatch one envelope. `None` means the stream is closed without a
    /// response (rate limited).
    pub async fn handle(self: &Arc<Self>, from: PeerId, envelope: RequestEnvelope) -> Option<Response> {
        let admission = self
            .limiter
            .lock()
            .expect("rate limiter lock poisoned")
            .admit(from, Instant::now());
        if admission == Admission::Drop {
            self.metrics.rate_limited_total.inc();
            debug!(peer = %from, "rate limited; dropping stream");
            return None;
        }

        let request = match parse_request(&envelope.0) {
            Ok(req) => req,
            Err(ParseFailure::UnknownType) => {
                self.metrics.invalid_msg_total.inc();
                return Some(Response::failure(RequestError::UnsupportedRequest.to_string()));
            }
            Err(_) => {
                self.metrics.invalid_msg_total.inc();
                return Some(Response::failure(RequestError::InvalidRequest.to_string()));
            }
        };

        let resp = match request {
            Request::Handshake(info) => self.handle_handshake(from, *info).await,
            Request::ListStores => self.handle_list_stores().await,
            Request::FindStore { store_id } => self.handle_find_store(&store_id).await,
            Request::GetStoreContent { store_id } => self.handle_get_content(&store_id).await,
            Request::GetFileRange { store_id, range_start, range_end, chunk_id } => {
                self.handle_get_range(&store_id, range_start, range_end, chunk_id).await
            }
            Request::GetUrn { urn } => self.handle_get_urn(&urn).await,
            Request::PeerExchange { max_peers, include_stores, include_capabilities, privacy_mode } => {
                self.handle_peer_exchange(
                    from,
                    max_peers,
                    include_stores,
                    include_capabilities,
                    privacy_mode,
                    None,
                )
            }
            Request::PrivacyPeerDiscovery { max_peers, store_id } => {
                let filter = match store_id {
                    Some(raw) => match StoreId::new_normalized(&raw) {
                        Ok(id) => Some(id),
                        Err(_) => {
                            return Some(Response::failure(
                                RequestError::InvalidRequest.to_string(),
                            ))
                        }
                    },
                    None => None,
                };
                self.handle_peer_exchange(from, max_peers, true, true, true, filter)
            }
            Request::RelayRequest { store_id, target_peer_id } => {
                self.handle_relay(&store_id, &target_peer_id).await
            }
        };
        Some(resp)
    }

    async fn handle_handshake(self: &Arc<Self>, from: PeerId, info: HandshakeInfo) -> Response {
        if info.network_id != self.identity.network_id {
            debug!(peer = %from, theirs = %info.network_id, "handshake network mismatch");
            return Response::failure("Network mismatch");
        }

        let Ok(public_key) = hex::decode(&info.public_key) else {
            return Response::failure(RequestError::InvalidRequest.to_string());
        };
        let Ok(advertised) = info.crypto_ipv6.parse::<Ipv6Addr>() else {
            return Response::failure(RequestError::InvalidRequest.to_string());
        };

        // The advertised overlay address must be the hash of the key the
        // peer just proved it can agree with.
        let verified = addressing::derive(&public_key) == advertised;
        if !verified {
            self.metrics.handshake_unverified_total.inc();
            // A connection we opened through crypto-IPv6 resolution must
            // verify; anything else here means the resolution lied.
            if self.strict_dials.contains(&from) {
                warn!(peer = %from, "resolved-address handshake failed verification; rejecting");
                return Response::failure("Address verification failed");
            }
            warn!(peer = %from, "handshake public key does not hash to advertised crypto-IPv6");
        }

        if let Err(e) = self.sessions.establish(from, &public_key) {
            debug!(peer = %from, err = %e, "session establishment failed");
            return Response::failure(RequestError::InvalidRequest.to_string());
        }

        let stores: BTreeSet<StoreId> = info
            .stores
            .iter()
            .filter_map(|s| StoreId::new(s).ok())
            .collect();
        self.peers.upsert(
            from,
            PeerObservation {
                crypto_ipv6: Some(advertised),
                capabilities: Some(info.known_capabilities()),
                announced_stores: Some(stores),
                protocol_version: Some(info.protocol_version),
                server_port: Some(info.server_port),
                encrypted_addresses: None,
                verified: Some(verified),
            },
        );

        let ours = self.local_handshake().await;
        let compatible: Vec<String> = ours
            .supported_features
            .iter()
            .filter(|f| info.supported_features.contains(f))
            .cloned()
            .collect();
        info!(peer = %from, verified, "handshake complete");

        Response::header_only(ResponseHeader {
            success: true,
            peer_id: Some(ours.peer_id.clone()),
            handshake: Some(ours),
            compatible_features: Some(compatible),
            ..Default::default()
        })
    }

    async fn handle_list_stores(&self) -> Response {
        let stores = match &self.stores {
            Some(reg) => reg.list_ids().await.iter().map(|s| s.to_string()).collect(),
            None => Vec::new(),
        };
        Response::header_only(ResponseHeader {
            success: true,
            peer_id: Some(self.identity.peer_id.to_base58()),
            stores: Some(stores),
            ..Default::default()
        })
    }

    async fn handle_find_store(&self, raw: &str) -> Response {
        if !is_valid_store_id(raw) {
            return Response::failure(RequestError::InvalidRequest.to_string());
        }
        let id = StoreId::new(raw).expect("validated above");
        let has = match &self.stores {
            Some(reg) => reg.contains(&id).await,
            None => false,
        };
        Response::header_only(ResponseHeader {
            success: true,
            peer_id: Some(self.identity.peer_id.to_base58()),
            crypto_ipv6: Some(self.identity.crypto_ipv6.to_string()),
            has_store: Some(has),
            ..Default::default()
        })
    }

    async fn handle_get_content(&self, raw: &str) -> Response {
        if !is_valid_store_id(raw) {
            return Response::failure(RequestError::InvalidRequest.to_string());
        }
        let id = StoreId::new(raw).expect("validated above");
        let Some(entry) = self.lookup(&id).await else {
            return Response::failure(RequestError::StoreNotFound.to_string());
        };
        Response {
            header: ResponseHeader {
                success: true,
                size: Some(entry.size),
                mime_type: Some(DIG_MIME_TYPE.to_string()),
                ..Default::default()
            },
            payload: entry.bytes.as_ref().clone(),
        }
    }

    async fn handle_get_range(
        &self,
        raw: &str,
        range_start: u64,
        range_end: u64,
        chunk_id: u32,
    ) -> Response {
        if !is_valid_store_id(raw) {
            return Response::failure(RequestError::InvalidRequest.to_string());
        }
        let id = StoreId::new(raw).expect("validated above");
        let Some(entry) = self.lookup(&id).await else {
            return Response::failure(RequestError::StoreNotFound.to_string());
        };
        if range_start > range_end || range_end >= entry.size {
            return Response::failure(RequestError::RangeOutOfBounds.to_string());
        }

        let slice = entry.bytes[range_start as usize..=range_end as usize].to_vec();
        Response {
            header: ResponseHeader {
                success: true,
                size: Some(range_end - range_start + 1),
                total_size: Some(entry.size),
                range_start: Some(range_start),
                range_end: Some(range_end),
                chunk_id: Some(chunk_id),
                is_partial: Some(true),
                mime_type: Some(DIG_MIME_TYPE.to_string()),
                ..Default::default()
            },
            payload: slice,
        }
    }

    async fn handle_get_urn(&self, raw: &str) -> Response {
        let urn = match DigUrn::parse(raw) {
            Ok(u) => u,
            Err(_) => return Response::failure(RequestError::InvalidUrn.to_string()),
        };
        let Some(entry) = self.lookup(&urn.store_id).await else {
            return Response::failure(RequestError::StoreNotFound.to_string());
        };

        if let Some(pin) = &urn.root_hash {
            let available = entry.content_hash_hex();
            let matches = match hex::decode(pin) {
                Ok(pin_bytes) if pin_bytes.len() == entry.content_hash.len() => {
                    bool::from(pin_bytes.as_slice().ct_eq(&entry.content_hash))
                }
                _ => false,
            };
            if !matches {
                return Response::failure(
                    RequestError::VersionMismatch { requested: pin.clone(), available }
                        .to_string(),
                );
            }
        }

        Response {
            header: ResponseHeader {
                success: true,
                size: Some(entry.size),
                mime_type: Some(DIG_MIME_TYPE.to_string()),
                ..Default::default()
            },
            payload: entry.bytes.as_ref().clone(),
        }
    }

    fn handle_peer_exchange(
        &self,
        from: PeerId,
        max_peers: u32,
        include_stores: bool,
        include_capabilities: bool,
        privacy_mode: bool,
        store_filter: Option<StoreId>,
    ) -> Response {
        let mut peers = self.peers.snapshot();
        peers.retain(|p| p.peer_id != from && p.peer_id != self.identity.peer_id);
        if let Some(filter) = &store_filter {
            peers.retain(|p| p.announced_stores.contains(filter));
        }
        peers.sort_by_key(|p| std::cmp::Reverse(p.last_seen_ms));
        peers.truncate(max_peers as usize);

        let entries: Vec<PeerExchangeEntry> = peers
            .into_iter()
            .map(|p| {
                let addresses = if privacy_mode {
                    // Privacy mode: never expose transport addresses.
                    None
                } else if p.server_port != 0 {
                    Some(vec![addressing::format_overlay(
                        p.crypto_ipv6,
                        p.server_port,
                        &p.peer_id,
                    )
                    .to_string()])
                } else {
                    None
                };
                PeerExchangeEntry {
                    peer_id: p.peer_id.to_base58(),
                    crypto_ipv6: p.crypto_ipv6.to_string(),
                    last_seen: p.last_seen_ms,
                    addresses,
                    stores: include_stores
                        .then(|| p.announced_stores.iter().map(|s| s.to_string()).collect()),
                    capabilities: include_capabilities
                        .then(|| p.capabilities.iter().map(|c| capability_code(*c)).collect()),
                }
            })
            .collect();

        Response::header_only(ResponseHeader {
            success: true,
            peer_id: Some(self.identity.peer_id.to_base58()),
            peers: Some(entries),
            ..Default::default()
        })
    }

    async fn handle_relay(&self, raw: &str, target: &str) -> Response {
        if !is_valid_store_id(raw) {
            return Response::failure(RequestError::InvalidRequest.to_string());
        }
        let can_relay = self
            .capabilities
            .read()
            .expect("capability set lock poisoned")
            .contains(&Capability::TurnRelay);
        if !can_relay {
            return Response::failure(RequestError::UnsupportedRequest.to_string());
        }
        let Ok(target) = PeerId::from_str(target) else {
            return Response::failure(RequestError::InvalidRequest.to_string());
        };
        let id = StoreId::new(raw).expect("validated above");

        // Serve from the local copy when one exists; relaying is only for
        // stores this node does not hold.
        if let Some(entry) = self.lookup(&id).await {
            return Response {
                header: ResponseHeader {
                    success: true,
                    size: Some(entry.size),
                    mime_type: Some(DIG_MIME_TYPE.to_string()),
                    ..Default::default()
                },
                payload: entry.bytes.as_ref().clone(),
            };
        }

        let Some(relay) = self.relay.get() else {
            return Response::failure("Relay unavailable");
        };
        match relay.fetch_store(target, id).await {
            Some(bytes) => Response {
                header: ResponseHeader {
                    success: true,
                    size: Some(bytes.len() as u64),
                    mime_type: Some(DIG_MIME_TYPE.to_string()),
                    ..Default::default()
                },
                payload: bytes,
            },
            None => Response::failure("Relay unavailable"),
        }
    }

    async fn lookup(&self, id: &StoreId) -> Option<crate::store::registry::StoreEntry> {
        match &self.stores {
            Some(reg) => reg.get(id).await,
            None => None,
        }
    }
}

/// Wire code for a capability (snake_case string).
pub fn capability_code(cap: Capability) -> String {
    serde_json::to_value(cap)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
