#![forbid(unsafe_code)]

//! Property tests for the boundary validators and the chunk plan.

use dignode::core::types::{
    is_valid_store_id, sanitize_resource_path, DigUrn, StoreId,
};
use dignode::store::partial::{chunk_bounds, chunk_count, CHUNK_SIZE};
use proptest::prelude::*;

proptest! {
    #[test]
    fn store_id_accepts_exactly_32_to_128_lowercase_hex(len in 0usize..200) {
        let s = "a".repeat(len);
        prop_assert_eq!(is_valid_store_id(&s), (32..=128).contains(&len));
    }

    #[test]
    fn store_id_rejects_non_hex(s in "[g-zG-Z!@#./ -]{32,64}") {
        prop_assert!(StoreId::new(&s).is_err());
    }

    #[test]
    fn sanitized_paths_never_escape(raw in "[a-zA-Z0-9_./\\\\-]{1,64}") {
        if let Ok(clean) = sanitize_resource_path(&raw) {
            prop_assert!(!clean.contains(".."));
            prop_assert!(!clean.starts_with('/'));
            prop_assert!(!clean.contains('\\'));
            prop_assert!(!clean.contains("//"));
        }
    }

    #[test]
    fn urn_roundtrip(id_len in 16usize..=64, with_hash in any::<bool>(), key in "[a-z0-9_][a-z0-9_.]{0,15}") {
        let store_id = "ab".repeat(id_len);
        let root_hash = with_hash.then(|| "cd".repeat(24));
        let urn = DigUrn {
            store_id: StoreId::new(&store_id).unwrap(),
            root_hash: root_hash.clone(),
            resource_key: key.clone(),
        };
        let parsed = DigUrn::parse(&urn.format()).unwrap();
        prop_assert_eq!(parsed.store_id.as_str(), store_id.as_str());
        prop_assert_eq!(parsed.root_hash, root_hash);
        prop_assert_eq!(parsed.resource_key, key);
    }

    #[test]
    fn chunk_plan_covers_size_exactly(total in 1u64..=8 * 1024 * 1024) {
        let n = chunk_count(total, CHUNK_SIZE);
        let mut covered = 0u64;
        let mut next_start = 0u64;
        for i in 0..n {
            let (start, end) = chunk_bounds(i, total, CHUNK_SIZE).unwrap();
            prop_assert_eq!(start, next_start);
            prop_assert!(end >= start);
            prop_assert!(end < total);
            covered += end - start + 1;
            next_start = end + 1;
        }
        prop_assert_eq!(covered, total);
        prop_assert!(chunk_bounds(n, total, CHUNK_SIZE).is_none());
    }
}

#[test]
fn urn_scheme_is_case_insensitive() {
    let id = "ab".repeat(24);
    let lower = DigUrn::parse(&format!("urn:dig:chia:{id}")).unwrap();
    let upper = DigUrn::parse(&format!("URN:DIG:CHIA:{id}")).unwrap();
    assert_eq!(lower, upper);
}

#[test]
fn urn_rejects_bad_inputs() {
    assert!(DigUrn::parse("urn:dig:other:abcd").is_err());
    assert!(DigUrn::parse("urn:dig:chia:tooshort").is_err());
    let id = "ab".repeat(24);
    assert!(DigUrn::parse(&format!("urn:dig:chia:{id}:nothex")).is_err());
    assert!(DigUrn::parse(&format!("urn:dig:chia:{id}/../escape")).is_err());
}
