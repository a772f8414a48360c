#![forbid(unsafe_code)]

//! Store registry scanning behavior over a real temporary directory.

use dignode::core::types::StoreId;
use dignode::store::registry::{sha256, StoreRegistry};

fn valid_id(tag: char) -> String {
    std::iter::repeat(tag).take(48).collect()
}

#[tokio::test]
async fn scan_indexes_only_valid_dig_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(format!("{}.dig", valid_id('a'))), b"hello").unwrap();
    std::fs::write(dir.path().join("notahexname.dig"), b"junk").unwrap();
    std::fs::write(dir.path().join("README.txt"), b"docs").unwrap();
    // 31 hex chars: one short of the minimum.
    std::fs::write(dir.path().join(format!("{}.dig", "a".repeat(31))), b"x").unwrap();

    let reg = StoreRegistry::open(dir.path()).unwrap();
    reg.scan().await;

    let ids = reg.list_ids().await;
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].as_str(), valid_id('a'));
}

#[tokio::test]
async fn rescan_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(format!("{}.dig", valid_id('a'))), b"hello").unwrap();
    std::fs::write(dir.path().join(format!("{}.dig", valid_id('b'))), b"world").unwrap();

    let reg = StoreRegistry::open(dir.path()).unwrap();
    reg.scan().await;
    let first = reg.list_ids().await;
    let entry_a = reg.get(&StoreId::new(&valid_id('a')).unwrap()).await.unwrap();

    reg.scan().await;
    assert_eq!(reg.list_ids().await, first);
    let again = reg.get(&StoreId::new(&valid_id('a')).unwrap()).await.unwrap();
    assert_eq!(again.content_hash, entry_a.content_hash);
    assert_eq!(again.size, entry_a.size);
}

#[tokio::test]
async fn entry_carries_size_and_hash() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"hello".to_vec();
    std::fs::write(dir.path().join(format!("{}.dig", valid_id('a'))), &payload).unwrap();

    let reg = StoreRegistry::open(dir.path()).unwrap();
    reg.scan().await;

    let entry = reg.get(&StoreId::new(&valid_id('a')).unwrap()).await.unwrap();
    assert_eq!(entry.size, 5);
    assert_eq!(entry.bytes.as_ref(), &payload);
    assert_eq!(entry.content_hash, sha256(&payload));
    // The stem is not the content hash here, so the flag is down.
    assert!(!entry.content_verified);
}

#[tokio::test]
async fn verified_flag_set_when_name_is_the_hash() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"pinned-content".to_vec();
    let name = hex::encode(sha256(&payload));
    std::fs::write(dir.path().join(format!("{name}.dig")), &payload).unwrap();

    let reg = StoreRegistry::open(dir.path()).unwrap();
    reg.scan().await;

    let entry = reg.get(&StoreId::new(&name).unwrap()).await.unwrap();
    assert!(entry.content_verified);
}

#[tokio::test]
async fn refresh_drops_deleted_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(format!("{}.dig", valid_id('a')));
    std::fs::write(&path, b"hello").unwrap();

    let reg = StoreRegistry::open(dir.path()).unwrap();
    reg.scan().await;
    let id = StoreId::new(&valid_id('a')).unwrap();
    assert!(reg.contains(&id).await);

    std::fs::remove_file(&path).unwrap();
    reg.refresh(&id).await;
    assert!(!reg.contains(&id).await);
}
