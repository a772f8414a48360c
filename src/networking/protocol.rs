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

//! Wire protocol: request envelopes, response headers, and the stream codec.
//!
//! Every message is a single UTF-8 JSON object. A request is one JSON line.
//! A response is one JSON header; when it carries a binary payload the
//! header is terminated by a newline and followed by exactly `size` raw
//! bytes, written in 64 KiB slices. One request/response pair per stream.

use crate::core::types::{Capability, NodeType};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response::Codec;
use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};
use std::io;

/// Protocol identifier negotiated on each substream.
pub const PROTOCOL_NAME: StreamProtocol = StreamProtocol::new("/dig/1.0.0");

/// Hard cap on a request envelope.
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;
/// Hard cap on a response header line.
pub const MAX_HEADER_BYTES: u64 = 64 * 1024;
/// Hard cap on a response payload.
pub const MAX_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;
/// Write granularity for payload bytes.
pub const WIRE_CHUNK: usize = 64 * 1024;

/// Request types in the closed vocabulary.
pub const REQUEST_TYPES: &[&str] = &[
    "HANDSHAKE",
    "LIST_STORES",
    "FIND_STORE",
    "GET_STORE_CONTENT",
    "GET_FILE_RANGE",
    "GET_URN",
    "PEER_EXCHANGE",
    "PRIVACY_PEER_DISCOVERY",
    "RELAY_REQUEST",
];

/// Handshake body, sent symmetrically by both sides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Network identifier; mismatches are rejected.
    pub network_id: String,
    /// Protocol version spoken by the sender.
    pub protocol_version: u32,
    /// Software build version.
    pub software_version: String,
    /// Port the sender accepts connections on.
    pub server_port: u16,
    /// Role of the sender.
    pub node_type: NodeType,
    /// `(code, description)` capability pairs.
    pub capabilities: Vec<(String, String)>,
    /// Sender transport identity (base58 peer id).
    pub peer_id: String,
    /// Sender overlay address.
    pub crypto_ipv6: String,
    /// Sender overlay public key, hex. Must hash to `crypto_ipv6`.
    pub public_key: String,
    /// Milliseconds since the UNIX epoch at send time.
    pub timestamp: u64,
    /// Store ids held by the sender.
    pub stores: Vec<String>,
    /// Free-form feature strings; the response echoes the intersection.
    pub supported_features: Vec<String>,
}

impl HandshakeInfo {
    /// Capability codes recognized by this build, parsed out of the
    /// `(code, description)` pairs; unknown codes are ignored.
    pub fn known_capabilities(&self) -> std::collections::BTreeSet<Capability> {
        self.capabilities
            .iter()
            .filter_map(|(code, _)| serde_json::from_value(serde_json::Value::String(code.clone())).ok())
            .collect()
    }
}

/// Parsed request.
#[derive(Clone, Debug)]
pub enum Request {
    /// Symmetric handshake.
    Handshake(Box<HandshakeInfo>),
    /// Enumerate the server's store ids.
    ListStores,
    /// Ask whether the server holds one store.
    FindStore {
        /// Store in question.
        store_id: String,
    },
    /// Fetch a whole store.
    GetStoreContent {
        /// Store to fetch.
        store_id: String,
    },
    /// Fetch an inclusive byte range of a store.
    GetFileRange {
        /// Store to read from.
        store_id: String,
        /// First byte, inclusive.
        range_start: u64,
        /// Last byte, inclusive.
        range_end: u64,
        /// Caller-chosen chunk tag, echoed in the response.
        chunk_id: u32,
    },
    /// Resolve a `urn:dig:chia:` URN and serve the store it names.
    GetUrn {
        /// The URN, unparsed.
        urn: String,
    },
    /// Exchange known peers.
    PeerExchange {
        /// Upper bound on returned peers.
        max_peers: u32,
        /// Include announced store sets.
        include_stores: bool,
        /// Include capability sets.
        include_capabilities: bool,
        /// Omit transport addresses entirely.
        privacy_mode: bool,
    },
    /// Peer exchange that is always in privacy mode, optionally filtered
    /// to holders of one store.
    PrivacyPeerDiscovery {
        /// Upper bound on returned peers.
        max_peers: u32,
        /// Only return peers announcing this store.
        store_id: Option<String>,
    },
    /// Ask a relay-capable server to fetch a store from a third peer.
    RelayRequest {
        /// Store to fetch.
        store_id: String,
        /// Peer the relay should fetch from.
        target_peer_id: String,
    },
}

/// Why a request envelope failed to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseFailure {
    /// Not a JSON object, or no string `type` field.
    Malformed,
    /// `type` is outside the vocabulary.
    UnknownType,
    /// Known type with missing or ill-typed required fields.
    MissingFields,
}

/// Parse a request envelope. Unknown fields are ignored; a missing `type`
/// or malformed JSON is [`ParseFailure::Malformed`].
pub fn parse_request(bytes: &[u8]) -> Result<Request, ParseFailure> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|_| ParseFailure::Malformed)?;
    let obj = value.as_object().ok_or(ParseFailure::Malformed)?;
    let ty = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ParseFailure::Malformed)?;

    if !REQUEST_TYPES.contains(&ty) {
        return Err(ParseFailure::UnknownType);
    }

    fn field_str(
        obj: &serde_json::Map<String, serde_json::Value>,
        key: &str,
    ) -> Result<String, ParseFailure> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(ParseFailure::MissingFields)
    }
    fn field_u64(
        obj: &serde_json::Map<String, serde_json::Value>,
        key: &str,
    ) -> Result<u64, ParseFailure> {
        obj.get(key).and_then(|v| v.as_u64()).ok_or(ParseFailure::MissingFields)
    }

    let req = match ty {
        "HANDSHAKE" => {
            let info: HandshakeInfo =
                serde_json::from_value(value.clone()).map_err(|_| ParseFailure::MissingFields)?;
            Request::Handshake(Box::new(info))
        }
        "LIST_STORES" => Request::ListStores,
        "FIND_STORE" => Request::FindStore { store_id: field_str(obj, "store_id")? },
        "GET_STORE_CONTENT" => Request::GetStoreContent { store_id: field_str(obj, "store_id")? },
        "GET_FILE_RANGE" => Request::GetFileRange {
            store_id: field_str(obj, "store_id")?,
            range_start: field_u64(obj, "range_start")?,
            range_end: field_u64(obj, "range_end")?,
            chunk_id: field_u64(obj, "chunk_id")? as u32,
        },
        "GET_URN" => Request::GetUrn { urn: field_str(obj, "urn")? },
        "PEER_EXCHANGE" => Request::PeerExchange {
            max_peers: field_u64(obj, "max_peers")? as u32,
            include_stores: obj.get("include_stores").and_then(|v| v.as_bool()).unwrap_or(false),
            include_capabilities: obj
                .get("include_capabilities")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            privacy_mode: obj.get("privacy_mode").and_then(|v| v.as_bool()).unwrap_or(false),
        },
        "PRIVACY_PEER_DISCOVERY" => Request::PrivacyPeerDiscovery {
            max_peers: field_u64(obj, "max_peers")? as u32,
            store_id: obj.get("store_id").and_then(|v| v.as_str()).map(str::to_string),
        },
        "RELAY_REQUEST" => Request::RelayRequest {
            store_id: field_str(obj, "store_id")?,
            target_peer_id: field_str(obj, "target_peer_id")?,
        },
        _ => return Err(ParseFailure::UnknownType),
    };
    Ok(req)
}

/// Serialize a request to its wire envelope.
pub fn encode_request(req: &Request) -> Vec<u8> {
    let value = match req {
        Request::Handshake(info) => {
            let mut v = serde_json::to_value(info.as_ref()).unwrap_or_default();
            if let Some(obj) = v.as_object_mut() {
                obj.insert("type".into(), "HANDSHAKE".into());
            }
            v
        }
        Request::ListStores => serde_json::json!({ "type": "LIST_STORES" }),
        Request::FindStore { store_id } => {
            serde_json::json!({ "type": "FIND_STORE", "store_id": store_id })
        }
        Request::GetStoreContent { store_id } => {
            serde_json::json!({ "type": "GET_STORE_CONTENT", "store_id": store_id })
        }
        Request::GetFileRange { store_id, range_start, range_end, chunk_id } => serde_json::json!({
            "type": "GET_FILE_RANGE",
            "store_id": store_id,
            "range_start": range_start,
            "range_end": range_end,
            "chunk_id": chunk_id,
        }),
        Request::GetUrn { urn } => serde_json::json!({ "type": "GET_URN", "urn": urn }),
        Request::PeerExchange { max_peers, include_stores, include_capabilities, privacy_mode } => {
            serde_json::json!({
                "type": "PEER_EXCHANGE",
                "max_peers": max_peers,
                "include_stores": include_stores,
                "include_capabilities": include_capabilities,
                "privacy_mode": privacy_mode,
            })
        }
        Request::PrivacyPeerDiscovery { max_peers, store_id } => serde_json::json!({
            "type": "PRIVACY_PEER_DISCOVERY",
            "max_peers": max_peers,
            "store_id": store_id,
        }),
        Request::RelayRequest { store_id, target_peer_id } => serde_json::json!({
            "type": "RELAY_REQUEST",
            "store_id": store_id,
            "target_peer_id": target_peer_id,
        }),
    };
    serde_json::to_vec(&value).unwrap_or_default()
}

/// One peer as reported by `PEER_EXCHANGE` / `PRIVACY_PEER_DISCOVERY`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerExchangeEntry {
    /// Base58 peer id.
    pub peer_id: String,
    /// Overlay address.
    pub crypto_ipv6: String,
    /// Milliseconds since the UNIX epoch at the server's last observation.
    pub last_seen: u64,
    /// Overlay multiaddresses. MUST be absent in privacy mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<String>>,
    /// Announced store ids, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stores: Option<Vec<String>>,
    /// Capability codes, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// Response header. One flat shape serves every request type; absent
/// fields are omitted from the wire (the original protocol is JSON with
/// per-type field sets, not a tagged union).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Whether the request was served.
    pub success: bool,
    /// Short error message when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Responding peer id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Responding peer overlay address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_ipv6: Option<String>,
    /// Store ids (`LIST_STORES`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stores: Option<Vec<String>>,
    /// Whether the server holds the store (`FIND_STORE`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_store: Option<bool>,
    /// Payload byte count following the header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Full store size for range responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    /// Echoed range start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_start: Option<u64>,
    /// Echoed range end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<u64>,
    /// Echoed chunk tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
    /// True for range responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_partial: Option<bool>,
    /// Payload MIME type; its presence announces a payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Peers (`PEER_EXCHANGE` / `PRIVACY_PEER_DISCOVERY`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PeerExchangeEntry>>,
    /// Responder's handshake body (`HANDSHAKE`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeInfo>,
    /// Intersection of `supported_features` (`HANDSHAKE`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatible_features: Option<Vec<String>>,
}

impl ResponseHeader {
    /// Error response with a short wire message.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self { success: false, error: Some(msg.into()), ..Default::default() }
    }

    /// Number of payload bytes that follow this header on the stream.
    pub fn payload_len(&self) -> u64 {
        if self.success && self.mime_type.is_some() {
            self.size.unwrap_or(0)
        } else {
            0
        }
    }
}

/// A full response: header plus payload bytes (empty for header-only).
#[derive(Clone, Debug)]
pub struct Response {
    /// JSON header.
    pub header: ResponseHeader,
    /// Raw payload; length must equal `header.payload_len()`.
    pub payload: Vec<u8>,
}

impl Response {
    /// Header-only response.
    pub fn header_only(header: ResponseHeader) -> Self {
        Self { header, payload: Vec::new() }
    }

    /// Error response.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::header_only(ResponseHeader::failure(msg))
    }
}

/// Raw request envelope as read off the stream. Parsing is deferred to the
/// dispatcher so that unknown types still get an `UnsupportedRequest`
/// response instead of a codec error.
#[derive(Clone, Debug)]
pub struct RequestEnvelope(pub Vec<u8>);

/// Stream codec for `/dig/1.0.0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DigCodec;

#[async_trait::async_trait]
impl Codec for DigCodec {
    type Protocol = StreamProtocol;
    type Request = RequestEnvelope;
    type Response = Response;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<RequestEnvelope>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(MAX_REQUEST_BYTES + 1).read_to_end(&mut buf).await?;
        if buf.len() as u64 > MAX_REQUEST_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request too large"));
        }
        Ok(RequestEnvelope(buf))
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(MAX_HEADER_BYTES + MAX_PAYLOAD_BYTES)
            .read_to_end(&mut buf)
            .await?;

        let (header_bytes, payload) = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => (&buf[..pos], buf[pos + 1..].to_vec()),
            None => (&buf[..], Vec::new()),
        };
        if header_bytes.len() as u64 > MAX_HEADER_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too large"));
        }
        let header: ResponseHeader = serde_json::from_slice(header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let expected = header.payload_len();
        if payload.len() as u64 != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload length {} != advertised {}", payload.len(), expected),
            ));
        }
        Ok(Response { header, payload })
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: RequestEnvelope,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&req.0).await?;
        io.close().await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        resp: Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let expected = resp.header.payload_len();
        if resp.payload.len() as u64 != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response payload does not match header",
            ));
        }

        let header = serde_json::to_vec(&resp.header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        io.write_all(&header).await?;

        if !resp.payload.is_empty() {
            io.write_all(b"\n").await?;
            for slice in resp.payload.chunks(WIRE_CHUNK) {
                io.write_all(slice).await?;
            }
        }
        io.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_distinguished_from_malformed() {
        assert_eq!(
            parse_request(br#"{"type":"SELF_DESTRUCT"}"#).unwrap_err(),
            ParseFailure::UnknownType
        );
        assert_eq!(parse_request(b"not json").unwrap_err(), ParseFailure::Malformed);
        assert_eq!(
            parse_request(br#"{"type":"FIND_STORE"}"#).unwrap_err(),
            ParseFailure::MissingFields
        );
    }

    #[test]
    fn request_roundtrip() {
        let req = Request::GetFileRange {
            store_id: "ab".repeat(24),
            range_start: 0,
            range_end: 4095,
            chunk_id: 7,
        };
        let bytes = encode_request(&req);
        match parse_request(&bytes).unwrap() {
            Request::GetFileRange { range_start, range_end, chunk_id, .. } => {
                assert_eq!((range_start, range_end, chunk_id), (0, 4095, 7));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let req = parse_request(br#"{"type":"LIST_STORES","junk":42}"#).unwrap();
        assert!(matches!(req, Request::ListStores));
    }

    #[test]
    fn payload_len_requires_success_and_mime() {
        let mut h = ResponseHeader { success: true, size: Some(10), ..Default::default() };
        assert_eq!(h.payload_len(), 0);
        h.mime_type = Some("application/x-dig-archive".into());
        assert_eq!(h.payload_len(), 10);
        h.success = false;
        assert_eq!(h.payload_len(), 0);
    }
}
