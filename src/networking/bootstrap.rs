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

//! REST client for the hosted bootstrap service.
//!
//! The bootstrap service is a directory, registrar and relay of last
//! resort. Policy lives with the callers: the scheduler and the download
//! orchestrator must exhaust every peer path before any method here is
//! invoked. Registration never exposes real addresses in the public view;
//! they travel in the private `real_addresses` field only.

use crate::core::types::{Capability, StoreId};
use crate::networking::peer_registry::{PeerObservation, PeerRegistry};
use crate::networking::server::capability_code;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Bootstrap client errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No bootstrap servers configured.
    #[error("no bootstrap servers configured")]
    NotConfigured,
    /// Every configured server failed.
    #[error("all bootstrap servers failed")]
    AllFailed,
    /// HTTP client could not be built.
    #[error("http client")]
    Client,
}

/// `POST /register` body.
#[derive(Debug, Serialize)]
struct RegisterBody<'a> {
    peer_id: String,
    /// Overlay form only; the public directory never sees real addresses.
    addresses: Vec<String>,
    /// Private field consumed by the relay machinery.
    real_addresses: Vec<String>,
    crypto_ipv6: String,
    stores: Vec<String>,
    capabilities: Vec<String>,
    network_id: &'a str,
    software_version: &'a str,
    timestamp: u64,
    version: u32,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    success: bool,
    #[serde(default)]
    #[allow(dead_code)]
    peer_id: Option<String>,
    #[serde(default)]
    total_peers: Option<u64>,
}

/// One directory entry from `GET /crypto-ipv6-directory`.
#[derive(Clone, Debug, Deserialize)]
pub struct DirectoryPeer {
    /// Base58 peer id.
    pub peer_id: String,
    /// Overlay address.
    pub crypto_ipv6: String,
    /// Announced stores, when `includeStores=true`.
    #[serde(default)]
    pub stores: Option<Vec<String>>,
    /// Last observation, ms since UNIX epoch.
    #[serde(default)]
    pub last_seen: u64,
    /// Capability codes.
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    peers: Vec<DirectoryPeer>,
    #[serde(default)]
    #[allow(dead_code)]
    total: u64,
}

/// `POST /bootstrap-turn-direct` / `/bootstrap-turn-relay` body.
#[derive(Debug, Serialize)]
struct TurnBody<'a> {
    store_id: &'a str,
    from_peer_id: &'a str,
    to_peer_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TurnDirectResponse {
    success: bool,
    #[serde(default)]
    source_addresses: Vec<String>,
}

/// Registration payload assembled by the node.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Our peer id.
    pub peer_id: PeerId,
    /// Our overlay address.
    pub crypto_ipv6: Ipv6Addr,
    /// Overlay multiaddresses (public view).
    pub overlay_addresses: Vec<String>,
    /// Real transport addresses (private field).
    pub real_addresses: Vec<String>,
    /// Held stores.
    pub stores: Vec<StoreId>,
    /// Capability set.
    pub capabilities: BTreeSet<Capability>,
    /// Network identifier.
    pub network_id: String,
}

/// Client over one or more bootstrap base URLs, tried in order.
pub struct BootstrapClient {
    servers: Vec<String>,
    http: reqwest::Client,
}

impl BootstrapClient {
    /// Build the client. An empty server list is allowed; every call then
    /// returns [`BootstrapError::NotConfigured`].
    pub fn new(servers: Vec<String>) -> Result<Arc<Self>, BootstrapError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|_| BootstrapError::Client)?;
        Ok(Arc::new(Self { servers, http }))
    }

    /// Whether any server is configured.
    pub fn is_configured(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Advertise this node to every configured server. Succeeds when at
    /// least one accepts.
    pub async fn register(&self, reg: &Registration) -> Result<(), BootstrapError> {
        if self.servers.is_empty() {
            return Err(BootstrapError::NotConfigured);
        }
        let body = RegisterBody {
            peer_id: reg.peer_id.to_base58(),
            addresses: reg.overlay_addresses.clone(),
            real_addresses: reg.real_addresses.clone(),
            crypto_ipv6: reg.crypto_ipv6.to_string(),
            stores: reg.stores.iter().map(|s| s.to_string()).collect(),
            capabilities: reg.capabilities.iter().map(|c| capability_code(*c)).collect(),
            network_id: &reg.network_id,
            software_version: env!("CARGO_PKG_VERSION"),
            timestamp: unix_ms(),
            version: 1,
        };

        let mut ok = false;
        for server in &self.servers {
            let url = format!("{server}/register");
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) => match resp.json::<RegisterResponse>().await {
                    Ok(parsed) if parsed.success => {
                        debug!(server, total = ?parsed.total_peers, "registered with bootstrap");
                        ok = true;
                    }
                    Ok(_) => warn!(server, "bootstrap rejected registration"),
                    Err(e) => warn!(server, err = %e, "bad register response"),
                },
                Err(e) => warn!(server, err = %e, "bootstrap register failed"),
            }
        }
        if ok {
            Ok(())
        } else {
            Err(BootstrapError::AllFailed)
        }
    }

    /// Pull the crypto-IPv6 directory from the first server that answers.
    pub async fn directory(&self) -> Result<Vec<DirectoryPeer>, BootstrapError> {
        if self.servers.is_empty() {
            return Err(BootstrapError::NotConfigured);
        }
        for server in &self.servers {
            let url = format!("{server}/crypto-ipv6-directory?includeStores=true");
            match self.http.get(&url).send().await {
                Ok(resp) => match resp.json::<DirectoryResponse>().await {
                    Ok(parsed) => return Ok(parsed.peers),
                    Err(e) => warn!(server, err = %e, "bad directory response"),
                },
                Err(e) => warn!(server, err = %e, "bootstrap directory failed"),
            }
        }
        Err(BootstrapError::AllFailed)
    }

    /// Merge a directory pull into the peer registry. Returns how many
    /// entries were usable.
    pub async fn seed_registry(&self, peers: &PeerRegistry) -> Result<usize, BootstrapError> {
        let directory = self.directory().await?;
        let mut seeded = 0usize;
        for entry in directory {
            let Ok(peer_id) = parse_peer_id(&entry.peer_id) else { continue };
            let Ok(ipv6) = entry.crypto_ipv6.parse::<Ipv6Addr>() else { continue };
            let stores = entry.stores.as_deref().map(|list| {
                list.iter().filter_map(|s| StoreId::new(s).ok()).collect::<BTreeSet<_>>()
            });
            let capabilities = entry.capabilities.as_deref().map(|list| {
                list.iter()
                    .filter_map(|s| {
                        serde_json::from_value(serde_json::Value::String(s.clone())).ok()
                    })
                    .collect::<BTreeSet<Capability>>()
            });
            if peers.upsert(
                peer_id,
                PeerObservation {
                    crypto_ipv6: Some(ipv6),
                    announced_stores: stores,
                    capabilities,
                    ..Default::default()
                },
            ) {
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Ask for the direct-fallback addresses of a holder
    /// (`POST /bootstrap-turn-direct`).
    pub async fn turn_direct(
        &self,
        store_id: &StoreId,
        from: &PeerId,
        to: &PeerId,
    ) -> Result<Vec<String>, BootstrapError> {
        if self.servers.is_empty() {
            return Err(BootstrapError::NotConfigured);
        }
        let body = TurnBody {
            store_id: store_id.as_str(),
            from_peer_id: &from.to_base58(),
            to_peer_id: &to.to_base58(),
        };
        for server in &self.servers {
            let url = format!("{server}/bootstrap-turn-direct");
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) => match resp.json::<TurnDirectResponse>().await {
                    Ok(parsed) if parsed.success => return Ok(parsed.source_addresses),
                    Ok(_) => debug!(server, "turn-direct declined"),
                    Err(e) => warn!(server, err = %e, "bad turn-direct response"),
                },
                Err(e) => warn!(server, err = %e, "turn-direct failed"),
            }
        }
        Err(BootstrapError::AllFailed)
    }

    /// Fetch a store payload through the bootstrap relay
    /// (`POST /bootstrap-turn-relay`, octet-stream response).
    pub async fn turn_relay(
        &self,
        store_id: &StoreId,
        from: &PeerId,
        to: &PeerId,
    ) -> Result<Vec<u8>, BootstrapError> {
        if self.servers.is_empty() {
            return Err(BootstrapError::NotConfigured);
        }
        let body = TurnBody {
            store_id: store_id.as_str(),
            from_peer_id: &from.to_base58(),
            to_peer_id: &to.to_base58(),
        };
        for server in &self.servers {
            let url = format!("{server}/bootstrap-turn-relay");
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(bytes) if !bytes.is_empty() => return Ok(bytes.to_vec()),
                    Ok(_) => debug!(server, "turn-relay returned empty body"),
                    Err(e) => warn!(server, err = %e, "turn-relay body read failed"),
                },
                Ok(resp) => debug!(server, status = %resp.status(), "turn-relay refused"),
                Err(e) => warn!(server, err = %e, "turn-relay failed"),
            }
        }
        Err(BootstrapError::AllFailed)
    }

    /// Ask the service to broker a relay session (`POST /initiate-relay`).
    pub async fn initiate_relay(&self, from: &PeerId, to: &PeerId) -> Result<(), BootstrapError> {
        if self.servers.is_empty() {
            return Err(BootstrapError::NotConfigured);
        }
        let body = serde_json::json!({
            "from_peer_id": from.to_base58(),
            "to_peer_id": to.to_base58(),
        });
        for server in &self.servers {
            let url = format!("{server}/initiate-relay");
            if let Ok(resp) = self.http.post(&url).json(&body).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
        }
        Err(BootstrapError::AllFailed)
    }
}

// Directory entries are base58; decode exactly the way the wire gives them.
fn parse_peer_id(raw: &str) -> Result<PeerId, ()> {
    let bytes = bs58::decode(raw).into_vec().map_err(|_| ())?;
    PeerId::from_bytes(&bytes).map_err(|_| ())
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
