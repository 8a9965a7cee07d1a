//! Pack serialization.
//!
//! Output is deterministic: nodes are laid out sorted by id, assets sorted
//! by content hash, and nothing time- or run-dependent is written. Compiling
//! the same story against a warm cache therefore reproduces the container
//! byte for byte.
//!
//! Publishing is all-or-nothing. `write_pack_file` serializes to a sibling
//! temp file and renames it over the target only after a successful fsync;
//! a failure at any point removes the temp file and leaves the target
//! untouched.

use crate::pack::format::{
    AssetIndexEntry, NodeIndexEntry, PackHeader, ASSET_INDEX_ENTRY_LEN, ASSET_KIND_AUDIO,
    ASSET_KIND_IMAGE, FORMAT_VERSION, HEADER_LEN, NODE_FLAG_ENTRY_POINT, NODE_FLAG_TERMINAL,
    NODE_INDEX_ENTRY_LEN, NO_ASSET, TRIGGER_KIND_AUTO, TRIGGER_KIND_CHOICE, TRIGGER_KIND_TIMEOUT,
};
use crate::pack::{Pack, PackAsset, PackNode};
use crate::store::AssetKind;
use crate::story::{NodeId, Trigger};
use crate::util::gen_id;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata encoding failed: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("Pack too large: {0} does not fit the container format")]
    TooLarge(&'static str),

    #[error("Node id too long: \"{0}\"")]
    OversizeNodeId(NodeId),

    #[error("Too many transitions on node \"{0}\"")]
    OversizeTransitions(NodeId),

    #[error("Node \"{node}\" references asset {hash} missing from the pack")]
    MissingAsset { node: NodeId, hash: String },

    #[error("Node \"{node}\" transition targets unknown node \"{target}\"")]
    UnknownTarget { node: NodeId, target: NodeId },

    #[error("Invalid content hash \"{0}\" (expected 64 hex chars)")]
    InvalidHash(String),
}

/// Serialize a pack into `out`. See the module docs for layout and
/// determinism guarantees.
pub fn serialize<W: Write>(pack: &Pack, out: &mut W) -> Result<(), SerializationError> {
    let mut nodes: Vec<&PackNode> = pack.nodes.iter().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let mut assets: Vec<&PackAsset> = pack.assets.iter().collect();
    assets.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
    assets.dedup_by(|a, b| a.content_hash == b.content_hash);

    let node_ordinals: HashMap<&NodeId, u32> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (&n.id, i as u32))
        .collect();
    let asset_ordinals: HashMap<&str, i32> = assets
        .iter()
        .enumerate()
        .map(|(i, a)| (a.content_hash.as_str(), i as i32))
        .collect();

    let node_count =
        u32::try_from(nodes.len()).map_err(|_| SerializationError::TooLarge("node count"))?;
    let asset_count =
        u32::try_from(assets.len()).map_err(|_| SerializationError::TooLarge("asset count"))?;

    let meta_bytes = serde_json::to_vec(&pack.meta)?;
    let meta_len =
        u32::try_from(meta_bytes.len()).map_err(|_| SerializationError::TooLarge("metadata"))?;

    let mut records: Vec<Vec<u8>> = Vec::with_capacity(nodes.len());
    for node in &nodes {
        records.push(encode_node_record(node, &node_ordinals, &asset_ordinals)?);
    }

    let node_index_off = (HEADER_LEN as u64) + meta_len as u64;
    let records_off = node_index_off + nodes.len() as u64 * NODE_INDEX_ENTRY_LEN as u64;
    let records_total: u64 = records.iter().map(|r| r.len() as u64).sum();
    let asset_index_off = records_off + records_total;
    let blobs_off = asset_index_off + assets.len() as u64 * ASSET_INDEX_ENTRY_LEN as u64;

    let header = PackHeader {
        version: FORMAT_VERSION,
        node_count,
        asset_count,
        node_index_off,
        asset_index_off,
        meta_len,
    };
    out.write_all(&header.encode())?;
    out.write_all(&meta_bytes)?;

    let mut record_off = records_off;
    for (node, record) in nodes.iter().zip(records.iter()) {
        let record_len =
            u32::try_from(record.len()).map_err(|_| SerializationError::TooLarge("node record"))?;
        let mut flags = 0u32;
        if node.entry_point {
            flags |= NODE_FLAG_ENTRY_POINT;
        }
        if node.terminal {
            flags |= NODE_FLAG_TERMINAL;
        }
        let entry = NodeIndexEntry {
            record_off,
            record_len,
            flags,
        };
        out.write_all(&entry.encode())?;
        record_off += record.len() as u64;
    }

    for record in &records {
        out.write_all(record)?;
    }

    let mut blob_off = blobs_off;
    for asset in &assets {
        let blob_len = u32::try_from(asset.bytes.len())
            .map_err(|_| SerializationError::TooLarge("asset blob"))?;
        let entry = AssetIndexEntry {
            blob_off,
            blob_len,
            kind: match asset.kind {
                AssetKind::Audio => ASSET_KIND_AUDIO,
                AssetKind::Image => ASSET_KIND_IMAGE,
            },
            content_hash: decode_hash(&asset.content_hash)?,
        };
        out.write_all(&entry.encode())?;
        blob_off += asset.bytes.len() as u64;
    }

    for asset in &assets {
        out.write_all(&asset.bytes)?;
    }

    debug!(
        target = "serializer",
        nodes = nodes.len(),
        assets = assets.len(),
        bytes = blob_off,
        "Pack serialized"
    );
    Ok(())
}

/// Serialize into a fresh buffer.
pub fn serialize_to_vec(pack: &Pack) -> Result<Vec<u8>, SerializationError> {
    let mut out = Vec::new();
    serialize(pack, &mut out)?;
    Ok(out)
}

/// Serialize and atomically publish the pack at `path`.
pub fn write_pack_file(pack: &Pack, path: &Path) -> Result<(), SerializationError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let bytes = serialize_to_vec(pack)?;
    let temp_path = path.with_extension(format!("tmp_{}", gen_id()));
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    info!(
        target = "serializer",
        path = ?path,
        bytes = bytes.len(),
        "Pack published"
    );
    Ok(())
}

fn encode_node_record(
    node: &PackNode,
    node_ordinals: &HashMap<&NodeId, u32>,
    asset_ordinals: &HashMap<&str, i32>,
) -> Result<Vec<u8>, SerializationError> {
    let id_bytes = node.id.as_str().as_bytes();
    let id_len = u16::try_from(id_bytes.len())
        .map_err(|_| SerializationError::OversizeNodeId(node.id.clone()))?;
    let transition_count = u16::try_from(node.transitions.len())
        .map_err(|_| SerializationError::OversizeTransitions(node.id.clone()))?;

    let mut record = Vec::with_capacity(2 + id_bytes.len() + 10 + node.transitions.len() * 9);
    record.extend_from_slice(&id_len.to_le_bytes());
    record.extend_from_slice(id_bytes);
    record.extend_from_slice(&asset_slot(node, node.audio.as_deref(), asset_ordinals)?.to_le_bytes());
    record.extend_from_slice(&asset_slot(node, node.image.as_deref(), asset_ordinals)?.to_le_bytes());
    record.extend_from_slice(&transition_count.to_le_bytes());

    for t in &node.transitions {
        let target =
            *node_ordinals
                .get(&t.target)
                .ok_or_else(|| SerializationError::UnknownTarget {
                    node: node.id.clone(),
                    target: t.target.clone(),
                })?;
        let (kind, value) = match t.trigger {
            Trigger::AutoAdvance => (TRIGGER_KIND_AUTO, 0u32),
            Trigger::Choice { index } => (TRIGGER_KIND_CHOICE, index),
            Trigger::Timeout { seconds } => (TRIGGER_KIND_TIMEOUT, seconds),
        };
        record.extend_from_slice(&target.to_le_bytes());
        record.push(kind);
        record.extend_from_slice(&value.to_le_bytes());
    }
    Ok(record)
}

fn asset_slot(
    node: &PackNode,
    hash: Option<&str>,
    asset_ordinals: &HashMap<&str, i32>,
) -> Result<i32, SerializationError> {
    match hash {
        None => Ok(NO_ASSET),
        Some(h) => asset_ordinals
            .get(h)
            .copied()
            .ok_or_else(|| SerializationError::MissingAsset {
                node: node.id.clone(),
                hash: h.to_string(),
            }),
    }
}

fn decode_hash(hex_hash: &str) -> Result<[u8; 32], SerializationError> {
    let bytes =
        hex::decode(hex_hash).map_err(|_| SerializationError::InvalidHash(hex_hash.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SerializationError::InvalidHash(hex_hash.to_string()))?;
    Ok(arr)
}
