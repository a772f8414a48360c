#![forbid(unsafe_code)]

//! Golden request/response behavior of the protocol server: listing,
//! whole-store and range serving, URN pinning, and rate limiting.

use dignode::core::session::SessionKeyring;
use dignode::core::types::{Capability, NodeType, StoreId, DIG_MIME_TYPE};
use dignode::monitoring::metrics::Metrics;
use dignode::networking::p2p::StrictDials;
use dignode::networking::peer_registry::PeerRegistry;
use dignode::networking::protocol::RequestEnvelope;
use dignode::networking::rate_limit::{RateLimitParams, RateLimiter};
use dignode::networking::server::{LocalIdentity, ProtocolServer};
use dignode::store::registry::StoreRegistry;
use libp2p::PeerId;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const STORE_A: &str =
    "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"; // 48 hex chars
const STORE_B: &str =
    "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

async fn server_with_stores(
    dir: &tempfile::TempDir,
    capacity: u32,
) -> (Arc<ProtocolServer>, Arc<StoreRegistry>) {
    std::fs::write(dir.path().join(format!("{STORE_A}.dig")), b"hello").unwrap();
    std::fs::write(dir.path().join(format!("{STORE_B}.dig")), b"world").unwrap();

    let stores = StoreRegistry::open(dir.path()).unwrap();
    stores.scan().await;

    let peer_id = PeerId::random();
    let sessions = Arc::new(SessionKeyring::new([5u8; 32]));
    let identity = LocalIdentity {
        peer_id,
        crypto_ipv6: "fd00::1".parse().unwrap(),
        public_key_hex: hex::encode(sessions.public_key()),
        server_port: 4861,
        network_id: "testnet".to_string(),
        node_type: NodeType::Full,
    };
    let capabilities = Arc::new(RwLock::new(BTreeSet::from([
        Capability::StoreSync,
        Capability::ByteRangeDownload,
    ])));
    let peers = Arc::new(PeerRegistry::new(peer_id, Duration::from_secs(600)));
    let metrics = Arc::new(Metrics::new().unwrap());

    let server = ProtocolServer::new(
        identity,
        capabilities,
        Some(Arc::clone(&stores)),
        peers,
        sessions,
        RateLimiter::new(RateLimitParams { capacity }),
        StrictDials::default(),
        metrics,
    );
    (server, stores)
}

fn envelope(json: serde_json::Value) -> RequestEnvelope {
    RequestEnvelope(serde_json::to_vec(&json).unwrap())
}

#[tokio::test]
async fn list_stores_returns_all_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with_stores(&dir, 100).await;

    let resp = server
        .handle(PeerId::random(), envelope(serde_json::json!({"type": "LIST_STORES"})))
        .await
        .unwrap();
    assert!(resp.header.success);
    assert_eq!(
        resp.header.stores.unwrap(),
        vec![STORE_A.to_string(), STORE_B.to_string()]
    );
}

#[tokio::test]
async fn get_store_content_serves_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with_stores(&dir, 100).await;

    let resp = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({"type": "GET_STORE_CONTENT", "store_id": STORE_A})),
        )
        .await
        .unwrap();
    assert!(resp.header.success);
    assert_eq!(resp.header.size, Some(5));
    assert_eq!(resp.header.mime_type.as_deref(), Some(DIG_MIME_TYPE));
    assert_eq!(resp.payload, b"hello");
}

#[tokio::test]
async fn missing_store_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with_stores(&dir, 100).await;

    let absent = "c".repeat(48);
    let resp = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({"type": "GET_STORE_CONTENT", "store_id": absent})),
        )
        .await
        .unwrap();
    assert!(!resp.header.success);
    assert_eq!(resp.header.error.as_deref(), Some("Store not found"));
    assert!(resp.payload.is_empty());
}

#[tokio::test]
async fn file_range_returns_exact_span() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with_stores(&dir, 100).await;

    let resp = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({
                "type": "GET_FILE_RANGE",
                "store_id": STORE_A,
                "range_start": 1,
                "range_end": 3,
                "chunk_id": 9,
            })),
        )
        .await
        .unwrap();
    assert!(resp.header.success);
    // Inclusive bounds: 3 - 1 + 1 bytes.
    assert_eq!(resp.payload, b"ell");
    assert_eq!(resp.header.size, Some(3));
    assert_eq!(resp.header.total_size, Some(5));
    assert_eq!(resp.header.chunk_id, Some(9));
    assert_eq!(resp.header.is_partial, Some(true));
}

#[tokio::test]
async fn file_range_bounds_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with_stores(&dir, 100).await;

    // range_end == size - 1 succeeds.
    let ok = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({
                "type": "GET_FILE_RANGE",
                "store_id": STORE_A,
                "range_start": 0,
                "range_end": 4,
                "chunk_id": 0,
            })),
        )
        .await
        .unwrap();
    assert!(ok.header.success);
    assert_eq!(ok.payload.len(), 5);

    // range_end == size fails.
    let bad = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({
                "type": "GET_FILE_RANGE",
                "store_id": STORE_A,
                "range_start": 0,
                "range_end": 5,
                "chunk_id": 0,
            })),
        )
        .await
        .unwrap();
    assert!(!bad.header.success);
    assert_eq!(bad.header.error.as_deref(), Some("Range out of bounds"));
}

#[tokio::test]
async fn urn_pin_mismatch_names_both_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let (server, stores) = server_with_stores(&dir, 100).await;

    let entry = stores.get(&StoreId::new(STORE_A).unwrap()).await.unwrap();
    let available = entry.content_hash_hex();
    let wrong = "f".repeat(64);

    let resp = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({
                "type": "GET_URN",
                "urn": format!("urn:dig:chia:{STORE_A}:{wrong}/index.html"),
            })),
        )
        .await
        .unwrap();
    assert!(!resp.header.success);
    assert_eq!(
        resp.header.error.unwrap(),
        format!("Version mismatch: requested {wrong}, available {available}")
    );

    // The correct pin serves the payload.
    let resp = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({
                "type": "GET_URN",
                "urn": format!("urn:dig:chia:{STORE_A}:{available}"),
            })),
        )
        .await
        .unwrap();
    assert!(resp.header.success);
    assert_eq!(resp.payload, b"hello");
}

#[tokio::test]
async fn unknown_type_and_bad_fields_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with_stores(&dir, 100).await;

    let unknown = server
        .handle(PeerId::random(), envelope(serde_json::json!({"type": "FROBNICATE"})))
        .await
        .unwrap();
    assert_eq!(unknown.header.error.as_deref(), Some("Unsupported request"));

    let missing = server
        .handle(PeerId::random(), envelope(serde_json::json!({"type": "FIND_STORE"})))
        .await
        .unwrap();
    assert_eq!(missing.header.error.as_deref(), Some("Invalid request"));

    let invalid_id = server
        .handle(
            PeerId::random(),
            envelope(serde_json::json!({"type": "FIND_STORE", "store_id": "zz"})),
        )
        .await
        .unwrap();
    assert_eq!(invalid_id.header.error.as_deref(), Some("Invalid request"));
}

#[tokio::test]
async fn resolved_dial_handshake_must_verify() {
    let peer_id = PeerId::random();
    let sessions = Arc::new(SessionKeyring::new([5u8; 32]));
    let strict = StrictDials::default();
    let server = ProtocolServer::new(
        LocalIdentity {
            peer_id,
            crypto_ipv6: "fd00::1".parse().unwrap(),
            public_key_hex: hex::encode(sessions.public_key()),
            server_port: 0,
            network_id: "testnet".to_string(),
            node_type: NodeType::Full,
        },
        Arc::new(RwLock::new(BTreeSet::new())),
        None,
        Arc::new(PeerRegistry::new(peer_id, Duration::from_secs(600))),
        sessions,
        RateLimiter::new(RateLimitParams { capacity: 100 }),
        strict.clone(),
        Arc::new(Metrics::new().unwrap()),
    );

    let remote = SessionKeyring::new([8u8; 32]);
    let good_ipv6 = dignode::core::addressing::derive(&remote.public_key());
    let handshake = |ipv6: String| {
        envelope(serde_json::json!({
            "type": "HANDSHAKE",
            "network_id": "testnet",
            "protocol_version": 1,
            "software_version": "0.0.0",
            "server_port": 0,
            "node_type": "FULL",
            "capabilities": [],
            "peer_id": PeerId::random().to_base58(),
            "crypto_ipv6": ipv6,
            "public_key": hex::encode(remote.public_key()),
            "timestamp": 0,
            "stores": [],
            "supported_features": [],
        }))
    };

    // An unsolicited connection with a mismatched address is kept as
    // unverified but still answered.
    let lenient_peer = PeerId::random();
    let resp = server.handle(lenient_peer, handshake("fd00::99".into())).await.unwrap();
    assert!(resp.header.success);

    // The same mismatch on a connection we dialed through crypto-IPv6
    // resolution is rejected.
    let strict_peer = PeerId::random();
    strict.mark(strict_peer);
    let resp = server.handle(strict_peer, handshake("fd00::99".into())).await.unwrap();
    assert!(!resp.header.success);
    assert_eq!(resp.header.error.as_deref(), Some("Address verification failed"));

    // A key that hashes to the advertised address passes the strict path.
    let resp = server.handle(strict_peer, handshake(good_ipv6.to_string())).await.unwrap();
    assert!(resp.header.success);
}

#[tokio::test]
async fn over_quota_peer_gets_silence() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = server_with_stores(&dir, 2).await;
    let peer = PeerId::random();

    for _ in 0..2 {
        let resp = server
            .handle(peer, envelope(serde_json::json!({"type": "LIST_STORES"})))
            .await;
        assert!(resp.is_some());
    }
    // Third request inside the window: stream closed without a response.
    let dropped = server
        .handle(peer, envelope(serde_json::json!({"type": "LIST_STORES"})))
        .await;
    assert!(dropped.is_none());

    // Other peers are unaffected.
    let other = server
        .handle(PeerId::random(), envelope(serde_json::json!({"type": "LIST_STORES"})))
        .await;
    assert!(other.is_some());
}
