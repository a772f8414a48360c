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

//! Privacy overlay: gossip announcements and crypto-IPv6 address
//! resolution.
//!
//! Public directories only ever see crypto-IPv6 identifiers. Real
//! transport addresses travel as AEAD ciphertexts: sealed for self in the
//! DHT (`/dig-privacy-addr/<ipv6>`), and sealed pairwise for handshaked
//! peers on the address-exchange topic. Peer announcements are jittered
//! and padded with dummy store ids to frustrate timing and content
//! correlation.

use crate::core::addressing;
use crate::core::error::AcquireError;
use crate::core::session::SessionKeyring;
use crate::core::types::{Capability, StoreId, PROTOCOL_VERSION};
use crate::networking::p2p::{
    NetClient, P2pEvent, TOPIC_ADDRESS_EXCHANGE, TOPIC_CAPABILITY_ANNOUNCEMENTS,
    TOPIC_PEER_DISCOVERY, TOPIC_STORE_ANNOUNCEMENTS,
};
use crate::networking::peer_registry::{PeerObservation, PeerRegistry};
use crate::networking::server::capability_code;
use crate::store::registry::{StoreEvent, StoreRegistry};
use libp2p::{Multiaddr, PeerId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info};

/// DHT key for "who has this store".
pub fn dig_store_key(id: &StoreId) -> String {
    format!("/dig-store/{id}")
}

/// DHT key for the generic peer directory.
pub fn dig_peer_key(peer: &PeerId) -> String {
    format!("/dig-peer/{}", peer.to_base58())
}

/// DHT key for a peer's encrypted address record.
pub fn dig_privacy_addr_key(ipv6: &Ipv6Addr) -> String {
    format!("/dig-privacy-addr/{ipv6}")
}

/// `/dig-store/<id>` record value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtStoreRecord {
    /// Holder peer id.
    pub peer_id: String,
    /// Holder overlay address.
    pub crypto_ipv6: String,
    /// Publish time, ms since UNIX epoch.
    pub timestamp: u64,
}

/// `/dig-peer/<peer-id>` record value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtPeerRecord {
    /// Peer id.
    pub peer_id: String,
    /// Overlay-form multiaddresses only.
    pub addresses: Vec<String>,
    /// Overlay address.
    pub crypto_ipv6: String,
    /// Announced store ids.
    pub stores: Vec<String>,
    /// Publish time, ms since UNIX epoch.
    pub timestamp: u64,
}

/// Peer announcement on `dig-privacy-peer-discovery`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// Announcer peer id.
    pub peer_id: String,
    /// Announcer overlay address.
    pub crypto_ipv6: String,
    /// Listen port.
    pub server_port: u16,
    /// Protocol version.
    pub protocol_version: u32,
    /// Capability codes.
    pub capabilities: Vec<String>,
    /// Announced stores, padded with dummy ids.
    pub stores: Vec<String>,
    /// Opaque noise field; never interpreted.
    pub scrambled_metadata: String,
    /// Send time, ms since UNIX epoch.
    pub timestamp: u64,
}

/// Record on `dig-privacy-address-exchange`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressExchangeRecord {
    /// Owner of the addresses.
    pub peer_id: String,
    /// Owner overlay address.
    pub crypto_ipv6: String,
    /// Intended reader; others cannot decrypt.
    pub recipient: String,
    /// Hex AEAD ciphertext of a JSON array of multiaddresses.
    pub encrypted_addresses: String,
    /// Send time, ms since UNIX epoch.
    pub timestamp: u64,
}

/// Record on `dig-privacy-store-announcements`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreAnnouncement {
    /// Announcer peer id.
    pub peer_id: String,
    /// Announcer overlay address.
    pub crypto_ipv6: String,
    /// Announced store ids.
    pub store_ids: Vec<String>,
    /// Send time, ms since UNIX epoch.
    pub timestamp: u64,
}

/// Record on `dig-privacy-capability-announcements`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityAnnouncement {
    /// Announcer peer id.
    pub peer_id: String,
    /// Announcer overlay address.
    pub crypto_ipv6: String,
    /// Capability codes.
    pub capabilities: Vec<String>,
    /// Send time, ms since UNIX epoch.
    pub timestamp: u64,
}

/// The overlay facility: announcements out, observations in, resolution
/// on demand.
pub struct PrivacyOverlay {
    client: NetClient,
    local_peer: PeerId,
    local_ipv6: Ipv6Addr,
    server_port: u16,
    sessions: Arc<SessionKeyring>,
    peers: Arc<PeerRegistry>,
    stores: Option<Arc<StoreRegistry>>,
    capabilities: Arc<RwLock<BTreeSet<Capability>>>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    /// Encrypted address records seen on gossip, by owner overlay address.
    addr_cache: RwLock<HashMap<Ipv6Addr, Vec<AddressExchangeRecord>>>,
    announce_jitter: Duration,
}

impl PrivacyOverlay {
    /// Assemble the overlay.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: NetClient,
        local_peer: PeerId,
        local_ipv6: Ipv6Addr,
        server_port: u16,
        sessions: Arc<SessionKeyring>,
        peers: Arc<PeerRegistry>,
        stores: Option<Arc<StoreRegistry>>,
        capabilities: Arc<RwLock<BTreeSet<Capability>>>,
        announce_jitter: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            local_peer,
            local_ipv6,
            server_port,
            sessions,
            peers,
            stores,
            capabilities,
            listen_addrs: RwLock::new(Vec::new()),
            addr_cache: RwLock::new(HashMap::new()),
            announce_jitter,
        })
    }

    /// Record a confirmed local listen address (the "real" addresses that
    /// get sealed into address records).
    pub fn add_listen_addr(&self, addr: Multiaddr) {
        let mut addrs = self.listen_addrs.write().expect("listen addr lock poisoned");
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    /// Run periodic announcements until `shutdown` flips. Each round is
    /// delayed by a uniform random jitter in `[0, announce_jitter]`.
    pub async fn run_announcer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let base = Duration::from_secs(60);
        loop {
            let jitter_ms = if self.announce_jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=self.announce_jitter.as_millis() as u64)
            };
            let wait = base + Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            self.announce_all().await;
        }
    }

    /// Publish the full announcement set once.
    pub async fn announce_all(&self) {
        let stores = self.local_store_ids().await;
        let capabilities = self.capability_codes();
        let now = unix_ms();

        // Peer discovery: padded with dummy ids so an observer cannot take
        // the announced set at face value.
        let mut padded: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        let dummies = rand::thread_rng().gen_range(2..=5);
        for _ in 0..dummies {
            padded.push(random_store_id());
        }
        let announcement = PeerAnnouncement {
            peer_id: self.local_peer.to_base58(),
            crypto_ipv6: self.local_ipv6.to_string(),
            server_port: self.server_port,
            protocol_version: PROTOCOL_VERSION,
            capabilities: capabilities.clone(),
            stores: padded,
            scrambled_metadata: random_hex(16),
            timestamp: now,
        };
        self.publish_json(TOPIC_PEER_DISCOVERY, &announcement).await;

        let store_ann = StoreAnnouncement {
            peer_id: self.local_peer.to_base58(),
            crypto_ipv6: self.local_ipv6.to_string(),
            store_ids: stores.iter().map(|s| s.to_string()).collect(),
            timestamp: now,
        };
        self.publish_json(TOPIC_STORE_ANNOUNCEMENTS, &store_ann).await;

        let cap_ann = CapabilityAnnouncement {
            peer_id: self.local_peer.to_base58(),
            crypto_ipv6: self.local_ipv6.to_string(),
            capabilities,
            timestamp: now,
        };
        self.publish_json(TOPIC_CAPABILITY_ANNOUNCEMENTS, &cap_ann).await;

        self.publish_address_records().await;
        self.publish_dht_records(&stores).await;
    }

    /// Seal the real addresses for self (DHT) and pairwise for every
    /// handshaked peer (gossip).
    async fn publish_address_records(&self) {
        let addrs: Vec<String> = self
            .listen_addrs
            .read()
            .expect("listen addr lock poisoned")
            .iter()
            .map(|a| a.to_string())
            .collect();
        if addrs.is_empty() {
            return;
        }
        let plaintext = match serde_json::to_vec(&addrs) {
            Ok(v) => v,
            Err(_) => return,
        };

        if let Ok(sealed) = self.sessions.self_secret().seal(&plaintext) {
            self.client
                .put_record(dig_privacy_addr_key(&self.local_ipv6), sealed)
                .await;
        }

        for peer in self.sessions.session_peers() {
            let Some(secret) = self.sessions.session(&peer) else { continue };
            let Ok(sealed) = secret.seal(&plaintext) else { continue };
            let record = AddressExchangeRecord {
                peer_id: self.local_peer.to_base58(),
                crypto_ipv6: self.local_ipv6.to_string(),
                recipient: peer.to_base58(),
                encrypted_addresses: hex::encode(sealed),
                timestamp: unix_ms(),
            };
            self.publish_json(TOPIC_ADDRESS_EXCHANGE, &record).await;
        }
    }

    async fn publish_dht_records(&self, stores: &[StoreId]) {
        let now = unix_ms();
        for id in stores {
            let record = DhtStoreRecord {
                peer_id: self.local_peer.to_base58(),
                crypto_ipv6: self.local_ipv6.to_string(),
                timestamp: now,
            };
            if let Ok(value) = serde_json::to_vec(&record) {
                self.client.put_record(dig_store_key(id), value).await;
            }
        }

        let overlay_addr =
            addressing::format_overlay(self.local_ipv6, self.server_port, &self.local_peer);
        let peer_record = DhtPeerRecord {
            peer_id: self.local_peer.to_base58(),
            addresses: vec![overlay_addr.to_string()],
            crypto_ipv6: self.local_ipv6.to_string(),
            stores: stores.iter().map(|s| s.to_string()).collect(),
            timestamp: now,
        };
        if let Ok(value) = serde_json::to_vec(&peer_record) {
            self.client.put_record(dig_peer_key(&self.local_peer), value).await;
        }
    }

    /// React to a registry change: re-announce on add, withdraw on remove.
    pub async fn on_store_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Added(id) => {
                let record = DhtStoreRecord {
                    peer_id: self.local_peer.to_base58(),
                    crypto_ipv6: self.local_ipv6.to_string(),
                    timestamp: unix_ms(),
                };
                if let Ok(value) = serde_json::to_vec(&record) {
                    self.client.put_record(dig_store_key(id), value).await;
                }
                let ann = StoreAnnouncement {
                    peer_id: self.local_peer.to_base58(),
                    crypto_ipv6: self.local_ipv6.to_string(),
                    store_ids: vec![id.to_string()],
                    timestamp: unix_ms(),
                };
                self.publish_json(TOPIC_STORE_ANNOUNCEMENTS, &ann).await;
            }
            StoreEvent::Removed(id) => {
                // Best-effort withdrawal; remote replicas age out naturally.
                self.client.remove_record(dig_store_key(id)).await;
            }
        }
    }

    /// Digest one gossip message into the peer registry / address cache.
    pub fn handle_gossip(&self, event: &P2pEvent) {
        let P2pEvent::Gossip { topic, data, .. } = event else { return };
        match topic.as_str() {
            TOPIC_PEER_DISCOVERY => {
                let Ok(ann) = serde_json::from_slice::<PeerAnnouncement>(data) else { return };
                let Some((peer_id, ipv6)) = parse_identity(&ann.peer_id, &ann.crypto_ipv6) else {
                    return;
                };
                // Announced sets are padded with dummies; only ids we can
                // validate are kept, and FIND_STORE remains the authority.
                let stores = parse_store_set(&ann.stores);
                self.peers.upsert(
                    peer_id,
                    PeerObservation {
                        crypto_ipv6: Some(ipv6),
                        capabilities: Some(parse_capability_set(&ann.capabilities)),
                        announced_stores: Some(stores),
                        protocol_version: Some(ann.protocol_version),
                        server_port: Some(ann.server_port),
                        encrypted_addresses: None,
                        verified: None,
                    },
                );
            }
            TOPIC_STORE_ANNOUNCEMENTS => {
                let Ok(ann) = serde_json::from_slice::<StoreAnnouncement>(data) else { return };
                let Some((peer_id, ipv6)) = parse_identity(&ann.peer_id, &ann.crypto_ipv6) else {
                    return;
                };
                self.peers.upsert(
                    peer_id,
                    PeerObservation {
                        crypto_ipv6: Some(ipv6),
                        announced_stores: Some(parse_store_set(&ann.store_ids)),
                        ..Default::default()
                    },
                );
            }
            TOPIC_CAPABILITY_ANNOUNCEMENTS => {
                let Ok(ann) = serde_json::from_slice::<CapabilityAnnouncement>(data) else {
                    return;
                };
                let Some((peer_id, ipv6)) = parse_identity(&ann.peer_id, &ann.crypto_ipv6) else {
                    return;
                };
                self.peers.upsert(
                    peer_id,
                    PeerObservation {
                        crypto_ipv6: Some(ipv6),
                        capabilities: Some(parse_capability_set(&ann.capabilities)),
                        ..Default::default()
                    },
                );
            }
            TOPIC_ADDRESS_EXCHANGE => {
                let Ok(rec) = serde_json::from_slice::<AddressExchangeRecord>(data) else {
                    return;
                };
                let Some((peer_id, ipv6)) = parse_identity(&rec.peer_id, &rec.crypto_ipv6) else {
                    return;
                };
                if rec.recipient != self.local_peer.to_base58() {
                    return;
                }
                if let Ok(cipher) = hex::decode(&rec.encrypted_addresses) {
                    self.peers.upsert(
                        peer_id,
                        PeerObservation {
                            crypto_ipv6: Some(ipv6),
                            encrypted_addresses: Some(cipher),
                            ..Default::default()
                        },
                    );
                }
                let mut cache = self.addr_cache.write().expect("addr cache lock poisoned");
                let entries = cache.entry(ipv6).or_default();
                entries.retain(|e| e.peer_id != rec.peer_id);
                entries.push(rec);
            }
            _ => {}
        }
    }

    /// Resolve an overlay multiaddress to dialable transport addresses.
    ///
    /// Cascade: DHT record decrypted with the owner's session secret, then
    /// gossip-received records, then the caller's bootstrap fallback.
    pub async fn resolve(&self, target: &Multiaddr) -> Result<Vec<Multiaddr>, AcquireError> {
        let Some((ipv6, owner)) = addressing::overlay_target(target) else {
            return Err(AcquireError::ResolutionUnavailable);
        };

        // 1. DHT record, sealed by the owner.
        if let Some(secret) = self.sessions.session(&owner) {
            for value in self.client.get_record(dig_privacy_addr_key(&ipv6)).await {
                if let Ok(plain) = secret.open(&value) {
                    if let Some(addrs) = decode_addr_list(&plain) {
                        return Ok(addrs);
                    }
                }
            }
        }

        // 2. Records received over the address-exchange topic.
        let cached: Vec<AddressExchangeRecord> = self
            .addr_cache
            .read()
            .expect("addr cache lock poisoned")
            .get(&ipv6)
            .cloned()
            .unwrap_or_default();
        for rec in cached {
            let Ok(peer) = PeerId::from_str(&rec.peer_id) else { continue };
            let Some(secret) = self.sessions.session(&peer) else { continue };
            let Ok(cipher) = hex::decode(&rec.encrypted_addresses) else { continue };
            if let Ok(plain) = secret.open(&cipher) {
                if let Some(addrs) = decode_addr_list(&plain) {
                    return Ok(addrs);
                }
            }
        }

        debug!(%ipv6, "overlay resolution failed locally");
        Err(AcquireError::ResolutionUnavailable)
    }

    async fn local_store_ids(&self) -> Vec<StoreId> {
        match &self.stores {
            Some(reg) => reg.list_ids().await,
            None => Vec::new(),
        }
    }

    fn capability_codes(&self) -> Vec<String> {
        self.capabilities
            .read()
            .expect("capability set lock poisoned")
            .iter()
            .map(|c| capability_code(*c))
            .collect()
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(payload) => self.client.publish(topic, payload).await,
            Err(e) => info!(err = %e, topic, "failed to encode announcement"),
        }
    }
}

fn parse_identity(peer_id: &str, crypto_ipv6: &str) -> Option<(PeerId, Ipv6Addr)> {
    let pid = PeerId::from_str(peer_id).ok()?;
    let ip = crypto_ipv6.parse::<Ipv6Addr>().ok()?;
    if ip.octets()[0] != 0xfd {
        return None;
    }
    Some((pid, ip))
}

fn parse_store_set(raw: &[String]) -> BTreeSet<StoreId> {
    raw.iter().filter_map(|s| StoreId::new(s).ok()).collect()
}

fn parse_capability_set(raw: &[String]) -> BTreeSet<Capability> {
    raw.iter()
        .filter_map(|s| serde_json::from_value(serde_json::Value::String(s.clone())).ok())
        .collect()
}

fn decode_addr_list(plain: &[u8]) -> Option<Vec<Multiaddr>> {
    let strings: Vec<String> = serde_json::from_slice(plain).ok()?;
    let addrs: Vec<Multiaddr> =
        strings.iter().filter_map(|s| s.parse::<Multiaddr>().ok()).collect();
    (!addrs.is_empty()).then_some(addrs)
}

fn random_store_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dht_keys_have_fixed_prefixes() {
        let id = StoreId::new(&"cd".repeat(16)).unwrap();
        assert!(dig_store_key(&id).starts_with("/dig-store/"));
        let ip: Ipv6Addr = "fd00::1".parse().unwrap();
        assert_eq!(dig_privacy_addr_key(&ip), "/dig-privacy-addr/fd00::1");
    }

    #[test]
    fn dummy_ids_validate_as_store_ids() {
        let id = random_store_id();
        assert!(crate::core::types::is_valid_store_id(&id));
    }
}
