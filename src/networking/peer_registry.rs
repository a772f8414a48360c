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
#![deny(missing_docs)]

//! In-memory registry of known peers, their capabilities and announced
//! store sets.
//!
//! Entries are created on first observation (handshake, gossip, or a
//! bootstrap directory pull), refreshed on every further observation, and
//! expired after the configured TTL. Two invariants hold at all times:
//! the local node is never inserted, and an entry without a crypto-IPv6 is
//! discarded rather than stored. Every mutation bumps a monotonic revision
//! counter that the sync scheduler uses to skip no-op cycles.

use crate::core::types::{Capability, StoreId};
use libp2p::PeerId;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// One observation of a peer. Fields left `None` keep whatever the
/// registry already holds for that peer.
#[derive(Clone, Debug, Default)]
pub struct PeerObservation {
    /// Overlay address; required for brand-new entries.
    pub crypto_ipv6: Option<Ipv6Addr>,
    /// Announced capability set (replaces the stored set).
    pub capabilities: Option<BTreeSet<Capability>>,
    /// Announced store set (replaces the stored set).
    pub announced_stores: Option<BTreeSet<StoreId>>,
    /// Protocol version from the handshake.
    pub protocol_version: Option<u32>,
    /// Listen port from the handshake (used to build overlay addresses).
    pub server_port: Option<u16>,
    /// Sealed transport addresses, opaque until a session secret opens them.
    pub encrypted_addresses: Option<Vec<u8>>,
    /// Whether the handshake public key hashed to the advertised address.
    pub verified: Option<bool>,
}

/// A peer as currently known.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Transport-layer identity.
    pub peer_id: PeerId,
    /// Crypto-IPv6 overlay identifier.
    pub crypto_ipv6: Ipv6Addr,
    /// Milliseconds since the UNIX epoch at the last observation.
    pub last_seen_ms: u64,
    /// Announced capabilities.
    pub capabilities: BTreeSet<Capability>,
    /// Announced store ids.
    pub announced_stores: BTreeSet<StoreId>,
    /// Protocol version (0 until a handshake completes).
    pub protocol_version: u32,
    /// Listen port (0 when unknown).
    pub server_port: u16,
    /// Sealed transport addresses, if any were exchanged.
    pub encrypted_addresses: Option<Vec<u8>>,
    /// False when the handshake key did not hash to the advertised address.
    pub verified: bool,
}

struct PeerRecord {
    info: PeerInfo,
    last_seen: Instant,
}

/// Thread-safe peer table.
pub struct PeerRegistry {
    local: PeerId,
    ttl: Duration,
    inner: RwLock<HashMap<PeerId, PeerRecord>>,
    revision: AtomicU64,
}

impl PeerRegistry {
    /// Create a registry that refuses entries for `local` and expires
    /// entries after `ttl`.
    pub fn new(local: PeerId, ttl: Duration) -> Self {
        Self {
            local,
            ttl,
            inner: RwLock::new(HashMap::new()),
            revision: AtomicU64::new(0),
        }
    }

    /// Merge an observation. Returns false when the observation was
    /// discarded (self, or a new peer without a crypto-IPv6).
    pub fn upsert(&self, peer_id: PeerId, obs: PeerObservation) -> bool {
        if peer_id == self.local {
            return false;
        }
        let now = Instant::now();
        let now_ms = unix_ms();

        let mut map = self.inner.write().expect("peer registry lock poisoned");
        match map.get_mut(&peer_id) {
            Some(rec) => {
                let info = &mut rec.info;
                if let Some(ip) = obs.crypto_ipv6 {
                    info.crypto_ipv6 = ip;
                }
                if let Some(caps) = obs.capabilities {
                    info.capabilities = caps;
                }
                if let Some(stores) = obs.announced_stores {
                    info.announced_stores = stores;
                }
                if let Some(v) = obs.protocol_version {
                    info.protocol_version = v;
                }
                if let Some(p) = obs.server_port {
                    info.server_port = p;
                }
                if let Some(addrs) = obs.encrypted_addresses {
                    info.encrypted_addresses = Some(addrs);
                }
                if let Some(v) = obs.verified {
                    info.verified = v;
                }
                info.last_seen_ms = now_ms;
                rec.last_seen = now;
            }
            None => {
                let Some(ip) = obs.crypto_ipv6 else {
                    // No overlay address, no entry.
                    return false;
                };
                map.insert(
                    peer_id,
                    PeerRecord {
                        info: PeerInfo {
                            peer_id,
                            crypto_ipv6: ip,
                            last_seen_ms: now_ms,
                            capabilities: obs.capabilities.unwrap_or_default(),
                            announced_stores: obs.announced_stores.unwrap_or_default(),
                            protocol_version: obs.protocol_version.unwrap_or(0),
                            server_port: obs.server_port.unwrap_or(0),
                            encrypted_addresses: obs.encrypted_addresses,
                            verified: obs.verified.unwrap_or(true),
                        },
                        last_seen: now,
                    },
                );
            }
        }
        drop(map);
        self.revision.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Look up one peer.
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.inner
            .read()
            .expect("peer registry lock poisoned")
            .get(peer_id)
            .map(|r| r.info.clone())
    }

    /// Peers announcing a capability.
    pub fn list_by_capability(&self, cap: Capability) -> Vec<PeerInfo> {
        self.inner
            .read()
            .expect("peer registry lock poisoned")
            .values()
            .filter(|r| r.info.capabilities.contains(&cap))
            .map(|r| r.info.clone())
            .collect()
    }

    /// Announced store set of one peer.
    pub fn stores_of(&self, peer_id: &PeerId) -> Option<BTreeSet<StoreId>> {
        self.inner
            .read()
            .expect("peer registry lock poisoned")
            .get(peer_id)
            .map(|r| r.info.announced_stores.clone())
    }

    /// Peers whose announced set contains `store_id`.
    pub fn holders_of(&self, store_id: &StoreId) -> Vec<PeerInfo> {
        self.inner
            .read()
            .expect("peer registry lock poisoned")
            .values()
            .filter(|r| r.info.announced_stores.contains(store_id))
            .map(|r| r.info.clone())
            .collect()
    }

    /// Drop a specific peer (e.g. after repeated failures).
    pub fn remove(&self, peer_id: &PeerId) {
        let removed = self
            .inner
            .write()
            .expect("peer registry lock poisoned")
            .remove(peer_id)
            .is_some();
        if removed {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Expire entries not observed within the TTL. Returns how many fell.
    pub fn expire(&self, now: Instant) -> usize {
        let mut map = self.inner.write().expect("peer registry lock poisoned");
        let before = map.len();
        let ttl = self.ttl;
        map.retain(|_, rec| now.saturating_duration_since(rec.last_seen) < ttl);
        let dropped = before - map.len();
        drop(map);
        if dropped > 0 {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        dropped
    }

    /// All current peers.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.inner
            .read()
            .expect("peer registry lock poisoned")
            .values()
            .map(|r| r.info.clone())
            .collect()
    }

    /// Union of all announced store ids.
    pub fn union_of_stores(&self) -> BTreeSet<StoreId> {
        self.inner
            .read()
            .expect("peer registry lock poisoned")
            .values()
            .flat_map(|r| r.info.announced_stores.iter().cloned())
            .collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.inner.read().expect("peer registry lock poisoned").len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic revision; bumped on every public mutation.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }
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

    fn ip(tag: u8) -> Ipv6Addr {
        let mut o = [0u8; 16];
        o[0] = 0xfd;
        o[15] = tag;
        Ipv6Addr::from(o)
    }

    #[test]
    fn self_is_never_inserted() {
        let me = PeerId::random();
        let reg = PeerRegistry::new(me, Duration::from_secs(600));
        let obs = PeerObservation { crypto_ipv6: Some(ip(1)), ..Default::default() };
        assert!(!reg.upsert(me, obs));
        assert!(reg.is_empty());
    }

    #[test]
    fn new_peer_without_address_is_discarded() {
        let reg = PeerRegistry::new(PeerId::random(), Duration::from_secs(600));
        assert!(!reg.upsert(PeerId::random(), PeerObservation::default()));
        assert!(reg.is_empty());
    }

    #[test]
    fn expiry_drops_stale_entries() {
        let reg = PeerRegistry::new(PeerId::random(), Duration::from_millis(0));
        let peer = PeerId::random();
        reg.upsert(
            peer,
            PeerObservation { crypto_ipv6: Some(ip(2)), ..Default::default() },
        );
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.expire(Instant::now() + Duration::from_millis(1)), 1);
        assert!(reg.get(&peer).is_none());
    }

    #[test]
    fn revision_bumps_on_mutation() {
        let reg = PeerRegistry::new(PeerId::random(), Duration::from_secs(600));
        let r0 = reg.revision();
        reg.upsert(
            PeerId::random(),
            PeerObservation { crypto_ipv6: Some(ip(3)), ..Default::default() },
        );
        assert!(reg.revision() > r0);
    }
}
