//! Pack container tests
//!
//! Round-trip fidelity, byte determinism, random access through the
//! indexes, corruption detection, and atomic publishing.

use storypack_core::pack::{
    serialize_to_vec, write_pack_file, FormatError, Pack, PackAsset, PackNode, PackReader,
    SerializationError,
};
use storypack_core::store::AssetStore;
use storypack_core::{AssetKind, NodeId, PackMeta, Transition, Trigger};
use tempfile::TempDir;

fn asset(kind: AssetKind, bytes: &[u8]) -> PackAsset {
    PackAsset {
        kind,
        content_hash: AssetStore::hash_bytes(bytes),
        bytes: bytes.to_vec(),
    }
}

fn pack_node(id: &str) -> PackNode {
    PackNode {
        id: NodeId::new(id),
        entry_point: false,
        terminal: false,
        audio: None,
        image: None,
        transitions: Vec::new(),
    }
}

/// Four nodes, two of them sharing one narration asset, one silent menu
/// node, one image.
fn sample_pack() -> Pack {
    let narration = asset(AssetKind::Audio, b"shared mp3 payload");
    let outro = asset(AssetKind::Audio, b"outro mp3 payload");
    let art = asset(AssetKind::Image, b"cover art");

    let mut start = pack_node("start");
    start.entry_point = true;
    start.audio = Some(narration.content_hash.clone());
    start.image = Some(art.content_hash.clone());
    start.transitions = vec![
        Transition {
            target: NodeId::new("cave"),
            trigger: Trigger::Choice { index: 0 },
        },
        Transition {
            target: NodeId::new("menu"),
            trigger: Trigger::Timeout { seconds: 30 },
        },
    ];

    let mut cave = pack_node("cave");
    cave.audio = Some(narration.content_hash.clone());
    cave.transitions = vec![Transition {
        target: NodeId::new("end"),
        trigger: Trigger::AutoAdvance,
    }];

    let mut menu = pack_node("menu");
    menu.transitions = vec![Transition {
        target: NodeId::new("end"),
        trigger: Trigger::Choice { index: 0 },
    }];

    let mut end = pack_node("end");
    end.terminal = true;
    end.audio = Some(outro.content_hash.clone());

    Pack {
        meta: PackMeta {
            title: "The Lost Map".to_string(),
            language: "en".to_string(),
            version: 1,
            description: "A test story".to_string(),
        },
        nodes: vec![start, cave, menu, end],
        assets: vec![narration, outro, art],
    }
}

#[test]
fn round_trip_preserves_structure() {
    let pack = sample_pack();
    let bytes = serialize_to_vec(&pack).unwrap();
    let reader = PackReader::from_bytes(bytes).unwrap();

    assert_eq!(reader.meta(), &pack.meta);
    assert_eq!(reader.node_count(), 4);
    assert_eq!(reader.asset_count(), 3);

    let restored = reader.to_pack().unwrap();
    let mut expected_nodes = pack.nodes.clone();
    expected_nodes.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(restored.nodes, expected_nodes);

    let mut expected_assets = pack.assets.clone();
    expected_assets.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
    assert_eq!(restored.assets, expected_assets);
}

#[test]
fn serialization_is_deterministic_across_input_order() {
    let pack = sample_pack();
    let mut shuffled = pack.clone();
    shuffled.nodes.reverse();
    shuffled.assets.reverse();

    assert_eq!(
        serialize_to_vec(&pack).unwrap(),
        serialize_to_vec(&shuffled).unwrap(),
        "layout depends only on content, not construction order"
    );
}

#[test]
fn shared_narration_stored_once() {
    // Two nodes point at the same content hash; the container carries the
    // payload a single time.
    let bytes = serialize_to_vec(&sample_pack()).unwrap();
    let reader = PackReader::from_bytes(bytes).unwrap();
    assert_eq!(reader.asset_count(), 3);

    let start = reader.node_by_id(&NodeId::new("start")).unwrap().unwrap();
    let cave = reader.node_by_id(&NodeId::new("cave")).unwrap().unwrap();
    assert_eq!(start.audio, cave.audio);
}

#[test]
fn entry_points_readable_from_index_alone() {
    let bytes = serialize_to_vec(&sample_pack()).unwrap();
    let reader = PackReader::from_bytes(bytes).unwrap();

    let entries = reader.entry_points();
    assert_eq!(entries.len(), 1);
    assert_eq!(reader.node_id(entries[0]).unwrap(), NodeId::new("start"));
}

#[test]
fn node_lookup_by_id() {
    let bytes = serialize_to_vec(&sample_pack()).unwrap();
    let reader = PackReader::from_bytes(bytes).unwrap();

    for id in ["start", "cave", "menu", "end"] {
        let node = reader.node_by_id(&NodeId::new(id)).unwrap().unwrap();
        assert_eq!(node.id, NodeId::new(id));
    }
    assert!(reader.node_by_id(&NodeId::new("missing")).unwrap().is_none());

    let end = reader.node_by_id(&NodeId::new("end")).unwrap().unwrap();
    assert!(end.terminal);
    assert!(!end.entry_point);
}

#[test]
fn silent_node_has_no_asset_slots() {
    let bytes = serialize_to_vec(&sample_pack()).unwrap();
    let reader = PackReader::from_bytes(bytes).unwrap();

    let menu = reader.node_by_id(&NodeId::new("menu")).unwrap().unwrap();
    assert_eq!(menu.audio, None);
    assert_eq!(menu.image, None);
    assert_eq!(menu.transitions.len(), 1);
}

#[test]
fn asset_payloads_verified_against_index_hash() {
    let pack = sample_pack();
    let bytes = serialize_to_vec(&pack).unwrap();

    let clean = PackReader::from_bytes(bytes.clone()).unwrap();
    let blob_off = clean.asset_entry(0).unwrap().blob_off as usize;

    let mut corrupted = bytes;
    corrupted[blob_off] ^= 0xFF;
    let reader = PackReader::from_bytes(corrupted).unwrap();

    assert!(matches!(
        reader.asset(0),
        Err(FormatError::CorruptAsset { ordinal: 0 })
    ));
    // Other assets are untouched and still verify.
    assert!(reader.asset(1).is_ok());
}

#[test]
fn truncated_and_garbage_input_rejected() {
    let bytes = serialize_to_vec(&sample_pack()).unwrap();

    assert!(matches!(
        PackReader::from_bytes(bytes[..20].to_vec()),
        Err(FormatError::Truncated(_))
    ));
    assert!(matches!(
        PackReader::from_bytes(bytes[..60].to_vec()),
        Err(FormatError::Truncated(_))
    ));
    assert!(matches!(
        PackReader::from_bytes(b"not a pack at all".to_vec()),
        Err(FormatError::Truncated(_)) | Err(FormatError::BadMagic)
    ));

    let mut wrong_magic = bytes;
    wrong_magic[0] = b'Z';
    assert!(matches!(
        PackReader::from_bytes(wrong_magic),
        Err(FormatError::BadMagic)
    ));
}

#[test]
fn unknown_transition_target_rejected_at_serialize_time() {
    let mut pack = sample_pack();
    pack.nodes[1].transitions.push(Transition {
        target: NodeId::new("ghost"),
        trigger: Trigger::AutoAdvance,
    });

    assert!(matches!(
        serialize_to_vec(&pack),
        Err(SerializationError::UnknownTarget { .. })
    ));
}

#[test]
fn missing_asset_reference_rejected_at_serialize_time() {
    let mut pack = sample_pack();
    pack.nodes[0].audio = Some(AssetStore::hash_bytes(b"never stored"));

    match serialize_to_vec(&pack) {
        Err(SerializationError::MissingAsset { node, .. }) => {
            assert_eq!(node, NodeId::new("start"));
        }
        other => panic!("expected MissingAsset, got {:?}", other.map(|v| v.len())),
    }
}

#[test]
fn write_pack_file_publishes_atomically() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("story.pack");

    write_pack_file(&sample_pack(), &target).unwrap();
    assert!(target.exists());
    let reader = PackReader::open(&target).unwrap();
    assert_eq!(reader.node_count(), 4);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "story.pack")
        .collect();
    assert!(leftovers.is_empty(), "no temp files left behind");
}

#[test]
fn failed_write_leaves_no_artifact() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("story.pack");

    let mut bad = sample_pack();
    bad.nodes[0].audio = Some(AssetStore::hash_bytes(b"never stored"));
    assert!(write_pack_file(&bad, &target).is_err());

    assert!(!target.exists());
    assert_eq!(
        std::fs::read_dir(dir.path()).unwrap().count(),
        0,
        "failed publish cleans up its temp file"
    );
}
