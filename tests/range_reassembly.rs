#![forbid(unsafe_code)]

//! Scenario: a large store fetched as byte ranges reassembles exactly,
//! and the wire codec round-trips header + payload framing.

use dignode::core::session::SessionKeyring;
use dignode::core::types::{Capability, NodeType};
use dignode::monitoring::metrics::Metrics;
use dignode::networking::p2p::StrictDials;
use dignode::networking::peer_registry::PeerRegistry;
use dignode::networking::protocol::{
    DigCodec, RequestEnvelope, Response, ResponseHeader, PROTOCOL_NAME,
};
use dignode::networking::rate_limit::{RateLimitParams, RateLimiter};
use dignode::networking::server::{LocalIdentity, ProtocolServer};
use dignode::store::registry::{sha256, StoreRegistry};
use futures::io::Cursor;
use libp2p::request_response::Codec;
use libp2p::PeerId;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const BIG_ID: &str = "dddddddddddddddddddddddddddddddddddddddddddddddd";

async fn big_store_server(dir: &tempfile::TempDir, payload: &[u8]) -> Arc<ProtocolServer> {
    std::fs::write(dir.path().join(format!("{BIG_ID}.dig")), payload).unwrap();
    let stores = StoreRegistry::open(dir.path()).unwrap();
    stores.scan().await;

    let peer_id = PeerId::random();
    let sessions = Arc::new(SessionKeyring::new([9u8; 32]));
    ProtocolServer::new(
        LocalIdentity {
            peer_id,
            crypto_ipv6: "fd00::9".parse().unwrap(),
            public_key_hex: hex::encode(sessions.public_key()),
            server_port: 0,
            network_id: "testnet".to_string(),
            node_type: NodeType::Full,
        },
        Arc::new(RwLock::new(BTreeSet::from([Capability::ByteRangeDownload]))),
        Some(stores),
        Arc::new(PeerRegistry::new(peer_id, Duration::from_secs(600))),
        sessions,
        RateLimiter::new(RateLimitParams { capacity: 1000 }),
        StrictDials::default(),
        Arc::new(Metrics::new().unwrap()),
    )
}

#[tokio::test]
async fn four_chunks_plus_one_byte_reassemble() {
    // 1 MiB + 1 byte of a deterministic pattern.
    let payload: Vec<u8> = (0..1_048_577u32).map(|i| (i % 251) as u8).collect();
    let dir = tempfile::tempdir().unwrap();
    let server = big_store_server(&dir, &payload).await;
    let requester = PeerId::random();

    let ranges = [
        (0u64, 262_143u64),
        (262_144, 524_287),
        (524_288, 786_431),
        (786_432, 1_048_575),
        (1_048_576, 1_048_576),
    ];

    let mut assembled = Vec::with_capacity(payload.len());
    for (chunk_id, (start, end)) in ranges.iter().enumerate() {
        let env = RequestEnvelope(
            serde_json::to_vec(&serde_json::json!({
                "type": "GET_FILE_RANGE",
                "store_id": BIG_ID,
                "range_start": start,
                "range_end": end,
                "chunk_id": chunk_id,
            }))
            .unwrap(),
        );
        let resp = server.handle(requester, env).await.unwrap();
        assert!(resp.header.success, "range {start}..{end} failed: {:?}", resp.header.error);
        assert_eq!(resp.payload.len() as u64, end - start + 1);
        assembled.extend_from_slice(&resp.payload);
    }

    assert_eq!(assembled.len(), payload.len());
    assert_eq!(sha256(&assembled), sha256(&payload));
}

#[tokio::test]
async fn codec_roundtrips_header_and_payload() {
    let mut codec = DigCodec;

    let resp = Response {
        header: ResponseHeader {
            success: true,
            size: Some(5),
            total_size: Some(100),
            range_start: Some(10),
            range_end: Some(14),
            chunk_id: Some(3),
            is_partial: Some(true),
            mime_type: Some("application/x-dig-archive".to_string()),
            ..Default::default()
        },
        payload: b"abcde".to_vec(),
    };

    let mut wire = Vec::new();
    {
        let mut cursor = Cursor::new(&mut wire);
        codec
            .write_response(&PROTOCOL_NAME, &mut cursor, resp.clone())
            .await
            .unwrap();
    }
    // Header line, newline, then exactly `size` raw bytes.
    let newline = wire.iter().position(|&b| b == b'\n').unwrap();
    assert_eq!(&wire[newline + 1..], b"abcde");

    let mut cursor = Cursor::new(wire.clone());
    let decoded = codec.read_response(&PROTOCOL_NAME, &mut cursor).await.unwrap();
    assert_eq!(decoded.payload, b"abcde");
    assert_eq!(decoded.header.range_start, Some(10));
    assert_eq!(decoded.header.chunk_id, Some(3));

    // A truncated payload is rejected, not silently shortened.
    let mut truncated = wire.clone();
    truncated.pop();
    let mut cursor = Cursor::new(truncated);
    assert!(codec.read_response(&PROTOCOL_NAME, &mut cursor).await.is_err());
}

#[tokio::test]
async fn codec_roundtrips_header_only_response() {
    let mut codec = DigCodec;
    let resp = Response::header_only(ResponseHeader {
        success: true,
        stores: Some(vec!["ab".repeat(24)]),
        ..Default::default()
    });

    let mut wire = Vec::new();
    {
        let mut cursor = Cursor::new(&mut wire);
        codec
            .write_response(&PROTOCOL_NAME, &mut cursor, resp)
            .await
            .unwrap();
    }
    assert!(!wire.contains(&b'\n'));

    let mut cursor = Cursor::new(wire);
    let decoded = codec.read_response(&PROTOCOL_NAME, &mut cursor).await.unwrap();
    assert!(decoded.payload.is_empty());
    assert_eq!(decoded.header.stores.unwrap().len(), 1);
}

#[tokio::test]
async fn codec_bounds_request_size() {
    let mut codec = DigCodec;
    let huge = vec![b'x'; 65 * 1024];
    let mut cursor = Cursor::new(huge);
    assert!(codec.read_request(&PROTOCOL_NAME, &mut cursor).await.is_err());

    let ok = serde_json::to_vec(&serde_json::json!({"type": "LIST_STORES"})).unwrap();
    let mut cursor = Cursor::new(ok.clone());
    let RequestEnvelope(read) = codec.read_request(&PROTOCOL_NAME, &mut cursor).await.unwrap();
    assert_eq!(read, ok);
}
