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

//! Core scalar types: store identifiers, URNs, capabilities, node types.
//!
//! A store id is the filename stem of a `.dig` archive and its network
//! identity at the same time: 32 to 128 lowercase hex characters. URNs
//! (`urn:dig:chia:<store-id>[:<root-hash>][/<resource-key>]`) may pin a
//! content root; the store id alone never does.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum store-id length in hex characters.
pub const STORE_ID_MIN_LEN: usize = 32;
/// Maximum store-id length in hex characters.
pub const STORE_ID_MAX_LEN: usize = 128;

/// MIME type served for every archive payload.
pub const DIG_MIME_TYPE: &str = "application/x-dig-archive";

/// Resource key used when a URN carries none.
pub const DEFAULT_RESOURCE_KEY: &str = "index.html";

/// Errors produced by boundary validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Store id is not 32..=128 lowercase hex characters.
    #[error("invalid store id")]
    InvalidStoreId,
    /// URN does not parse.
    #[error("invalid URN")]
    InvalidUrn,
    /// Resource path escapes the archive root or is malformed.
    #[error("invalid resource path")]
    InvalidPath,
}

/// Identifier of a `.dig` store: 32..=128 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreId(String);

impl StoreId {
    /// Validate and wrap a store id. Input must already be lowercase hex.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        if !is_valid_store_id(s) {
            return Err(ValidationError::InvalidStoreId);
        }
        Ok(Self(s.to_string()))
    }

    /// Validate case-insensitively, normalizing to lowercase.
    ///
    /// URNs accept mixed-case hex; on-disk names do not.
    pub fn new_normalized(s: &str) -> Result<Self, ValidationError> {
        let lower = s.to_ascii_lowercase();
        Self::new(&lower)
    }

    /// The id as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// On-disk filename for this store.
    pub fn file_name(&self) -> String {
        format!("{}.dig", self.0)
    }

    /// Sidecar filename for a partial download.
    pub fn part_file_name(&self) -> String {
        format!("{}.dig.part", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Long ids drown logs; keep the head.
        if self.0.len() > 16 {
            write!(f, "StoreId({}..)", &self.0[..16])
        } else {
            write!(f, "StoreId({})", self.0)
        }
    }
}

impl FromStr for StoreId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StoreId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<StoreId> for String {
    fn from(id: StoreId) -> Self {
        id.0
    }
}

/// True iff `s` is 32..=128 lowercase hex characters.
pub fn is_valid_store_id(s: &str) -> bool {
    (STORE_ID_MIN_LEN..=STORE_ID_MAX_LEN).contains(&s.len())
        && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// True iff `s` is 32..=128 hex characters of either case.
pub fn is_valid_hex_id(s: &str) -> bool {
    (STORE_ID_MIN_LEN..=STORE_ID_MAX_LEN).contains(&s.len())
        && s.bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F'))
}

/// Parsed `urn:dig:chia:` URN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigUrn {
    /// Addressed store.
    pub store_id: StoreId,
    /// Optional pinned content root (lowercase hex, same alphabet as ids).
    pub root_hash: Option<String>,
    /// Resource key inside the archive; defaults to `index.html`.
    pub resource_key: String,
}

impl DigUrn {
    /// Parse a URN. The scheme prefix is case-insensitive; the store id and
    /// root hash must be 32..=128 hex chars and are normalized to lowercase.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let rest = strip_prefix_ci(input.trim(), "urn:dig:chia:")
            .ok_or(ValidationError::InvalidUrn)?;

        let (id_part, resource) = match rest.split_once('/') {
            Some((head, key)) => (head, Some(key)),
            None => (rest, None),
        };

        let (store_raw, root_raw) = match id_part.split_once(':') {
            Some((s, h)) => (s, Some(h)),
            None => (id_part, None),
        };

        let store_id =
            StoreId::new_normalized(store_raw).map_err(|_| ValidationError::InvalidUrn)?;

        let root_hash = match root_raw {
            Some(h) => {
                if !is_valid_hex_id(h) {
                    return Err(ValidationError::InvalidUrn);
                }
                Some(h.to_ascii_lowercase())
            }
            None => None,
        };

        let resource_key = match resource {
            Some(k) if !k.is_empty() => {
                sanitize_resource_path(k).map_err(|_| ValidationError::InvalidUrn)?
            }
            _ => DEFAULT_RESOURCE_KEY.to_string(),
        };

        Ok(Self { store_id, root_hash, resource_key })
    }

    /// Render the canonical URN string.
    pub fn format(&self) -> String {
        let mut out = format!("urn:dig:chia:{}", self.store_id);
        if let Some(h) = &self.root_hash {
            out.push(':');
            out.push_str(h);
        }
        out.push('/');
        out.push_str(&self.resource_key);
        out
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    // get() keeps multi-byte input from panicking at the slice boundary.
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Normalize a resource path: backslashes become `/`, duplicate separators
/// collapse, a leading `/` is dropped, and any `..` component rejects the
/// whole path.
pub fn sanitize_resource_path(raw: &str) -> Result<String, ValidationError> {
    let unified = raw.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(ValidationError::InvalidPath),
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(ValidationError::InvalidPath);
    }
    Ok(parts.join("/"))
}

/// Role a node plays on the network, announced in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    /// Full store-holding participant.
    Full,
    /// Consumer without persistent stores.
    Light,
    /// Directory-only bootstrap participant.
    Bootstrap,
    /// Relay for NAT-restricted peers.
    Turn,
    /// Generic relay.
    Relay,
}

/// Closed capability vocabulary announced in handshakes and gossip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Participates in the store sync loop (outbound serving).
    StoreSync,
    /// Can relay store payloads between peers.
    TurnRelay,
    /// Can seed peers from the bootstrap directory.
    BootstrapDiscovery,
    /// Application-level encryption of per-peer artifacts.
    E2eEncryption,
    /// Serves `GET_FILE_RANGE`.
    ByteRangeDownload,
    /// Participates in gossip discovery topics.
    GossipDiscovery,
    /// Stores and serves DHT records.
    DhtStorage,
    /// Circuit relay transport.
    CircuitRelay,
    /// WebRTC NAT traversal.
    WebrtcNat,
    /// Answers mesh routing queries.
    MeshRouting,
}

impl Capability {
    /// Human-readable description, carried next to the code in handshakes.
    pub fn description(&self) -> &'static str {
        match self {
            Capability::StoreSync => "synchronizes .dig stores with peers",
            Capability::TurnRelay => "relays store payloads for unreachable peers",
            Capability::BootstrapDiscovery => "consumes the bootstrap directory",
            Capability::E2eEncryption => "encrypts per-peer artifacts end to end",
            Capability::ByteRangeDownload => "serves byte-range requests",
            Capability::GossipDiscovery => "announces and discovers peers over gossip",
            Capability::DhtStorage => "stores and resolves DHT records",
            Capability::CircuitRelay => "circuit relay transport",
            Capability::WebrtcNat => "webrtc NAT traversal",
            Capability::MeshRouting => "answers mesh routing queries",
        }
    }
}

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_id_boundaries() {
        let ok32 = "a".repeat(32);
        let ok128 = "a".repeat(128);
        assert!(StoreId::new(&ok32).is_ok());
        assert!(StoreId::new(&ok128).is_ok());
        assert!(StoreId::new(&"a".repeat(31)).is_err());
        assert!(StoreId::new(&"a".repeat(129)).is_err());
        assert!(StoreId::new(&"G".repeat(32)).is_err());
    }

    #[test]
    fn urn_defaults_resource_key() {
        let id = "ab".repeat(24);
        let urn = DigUrn::parse(&format!("URN:DIG:CHIA:{id}")).unwrap();
        assert_eq!(urn.resource_key, DEFAULT_RESOURCE_KEY);
        assert!(urn.root_hash.is_none());
    }

    #[test]
    fn path_traversal_rejected() {
        assert!(sanitize_resource_path("../etc/passwd").is_err());
        assert_eq!(sanitize_resource_path("/a//b\\c").unwrap(), "a/b/c");
    }
}
