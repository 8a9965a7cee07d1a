//! Asset store tests
//!
//! Content addressing, deduplication, recipe persistence across reopen,
//! and concurrent same-payload insertion.

use std::sync::Arc;
use storypack_core::store::{file_recipe_hash, recipe_hash, AssetKind, AssetStore};
use tempfile::TempDir;
use tokio::task::JoinSet;

fn open_store(root: &TempDir) -> AssetStore {
    AssetStore::open(root.path()).unwrap()
}

fn object_count(root: &TempDir) -> usize {
    std::fs::read_dir(root.path().join("objects")).unwrap().count()
}

#[test]
fn insert_round_trips() {
    let root = TempDir::new().unwrap();
    let store = open_store(&root);

    let asset = store.insert(AssetKind::Audio, b"narration bytes").unwrap();
    assert_eq!(asset.kind, AssetKind::Audio);
    assert_eq!(asset.len, 15);
    assert_eq!(
        asset.content_hash,
        AssetStore::hash_bytes(b"narration bytes")
    );

    let bytes = store.get(&asset.content_hash).unwrap().unwrap();
    assert_eq!(bytes, b"narration bytes");
    assert!(store.contains(&asset.content_hash));
    assert!(store.get("feedbeef").unwrap().is_none());
}

#[test]
fn hash_is_sha256_hex() {
    assert_eq!(
        AssetStore::hash_bytes(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn identical_payloads_share_one_object() {
    let root = TempDir::new().unwrap();
    let store = open_store(&root);

    let a = store.insert(AssetKind::Audio, b"same payload").unwrap();
    let b = store.insert(AssetKind::Audio, b"same payload").unwrap();

    assert_eq!(a.content_hash, b.content_hash);
    assert_eq!(store.len(), 1);
    assert_eq!(object_count(&root), 1, "one object file on disk");
}

#[test]
fn recipes_survive_reopen() {
    let root = TempDir::new().unwrap();
    let content_hash;
    {
        let store = open_store(&root);
        let asset = store.insert(AssetKind::Audio, b"encoded mp3").unwrap();
        content_hash = asset.content_hash.clone();
        store.record_recipe("recipe-aaa", &content_hash);
        store.flush().unwrap();
    }

    let reopened = open_store(&root);
    let hit = reopened.lookup_recipe("recipe-aaa").unwrap();
    assert_eq!(hit.content_hash, content_hash);
    assert_eq!(reopened.get(&content_hash).unwrap().unwrap(), b"encoded mp3");
}

#[test]
fn missing_object_entries_dropped_on_open() {
    let root = TempDir::new().unwrap();
    let content_hash;
    {
        let store = open_store(&root);
        let asset = store.insert(AssetKind::Image, b"artwork").unwrap();
        content_hash = asset.content_hash.clone();
        store.record_recipe("recipe-bbb", &content_hash);
        store.flush().unwrap();
    }
    std::fs::remove_file(root.path().join("objects").join(&content_hash)).unwrap();

    let reopened = open_store(&root);
    assert!(!reopened.contains(&content_hash));
    assert!(
        reopened.lookup_recipe("recipe-bbb").is_none(),
        "recipe pointing at a lost object is dropped too"
    );
}

#[tokio::test]
async fn concurrent_same_payload_inserts_are_safe() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(open_store(&root));

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let store = store.clone();
        set.spawn(async move { store.insert(AssetKind::Audio, b"hot payload").unwrap() });
    }

    let mut hashes = Vec::new();
    while let Some(joined) = set.join_next().await {
        hashes.push(joined.unwrap().content_hash);
    }

    assert_eq!(hashes.len(), 16);
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.len(), 1);
    assert_eq!(object_count(&root), 1);
}

#[test]
fn recipe_hash_covers_text_voice_and_profile() {
    #[derive(serde::Serialize)]
    struct Voice {
        name: &'static str,
    }
    #[derive(serde::Serialize)]
    struct Profile {
        bitrate: u32,
    }

    let base = recipe_hash("hello", &Voice { name: "amy" }, &Profile { bitrate: 64 }).unwrap();
    assert_eq!(
        base,
        recipe_hash("hello", &Voice { name: "amy" }, &Profile { bitrate: 64 }).unwrap()
    );
    assert_ne!(
        base,
        recipe_hash("goodbye", &Voice { name: "amy" }, &Profile { bitrate: 64 }).unwrap()
    );
    assert_ne!(
        base,
        recipe_hash("hello", &Voice { name: "joe" }, &Profile { bitrate: 64 }).unwrap()
    );
    assert_ne!(
        base,
        recipe_hash("hello", &Voice { name: "amy" }, &Profile { bitrate: 96 }).unwrap()
    );
}

#[test]
fn file_recipe_distinct_from_text_recipe() {
    #[derive(serde::Serialize)]
    struct Profile {
        bitrate: u32,
    }
    let p = Profile { bitrate: 64 };
    let from_text = recipe_hash("abc", &"voice", &p).unwrap();
    let from_file = file_recipe_hash("abc", &p).unwrap();
    assert_ne!(from_text, from_file);
}
