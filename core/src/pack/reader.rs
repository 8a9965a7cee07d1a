//! Pack reading.
//!
//! The reader parses the header and both index tables eagerly and decodes
//! node records on demand, mirroring how the playback device navigates the
//! container. `node_by_id` binary-searches the id-sorted node index, reading
//! only the id prefix of each probed record.

use crate::pack::format::{
    AssetIndexEntry, FormatError, NodeIndexEntry, PackHeader, ASSET_INDEX_ENTRY_LEN,
    ASSET_KIND_AUDIO, ASSET_KIND_IMAGE, HEADER_LEN, NODE_FLAG_ENTRY_POINT, NODE_FLAG_TERMINAL,
    NODE_INDEX_ENTRY_LEN, NO_ASSET, TRIGGER_KIND_AUTO, TRIGGER_KIND_CHOICE, TRIGGER_KIND_TIMEOUT,
};
use crate::pack::{Pack, PackAsset, PackNode};
use crate::store::AssetKind;
use crate::story::{NodeId, PackMeta, Transition, Trigger};
use sha2::{Digest, Sha256};
use std::path::Path;

pub struct PackReader {
    data: Vec<u8>,
    header: PackHeader,
    meta: PackMeta,
    node_index: Vec<NodeIndexEntry>,
    asset_index: Vec<AssetIndexEntry>,
}

impl PackReader {
    pub fn open(path: &Path) -> Result<Self, FormatError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, FormatError> {
        let header = PackHeader::decode(&data)?;

        let meta_end = HEADER_LEN + header.meta_len as usize;
        let meta_slice = data
            .get(HEADER_LEN..meta_end)
            .ok_or(FormatError::Truncated("metadata"))?;
        let meta: PackMeta = serde_json::from_slice(meta_slice)
            .map_err(|e| FormatError::CorruptMeta(e.to_string()))?;

        let node_index = read_table(
            &data,
            header.node_index_off,
            header.node_count as usize,
            NODE_INDEX_ENTRY_LEN,
            "node index",
            NodeIndexEntry::decode,
        )?;
        let asset_index = read_table(
            &data,
            header.asset_index_off,
            header.asset_count as usize,
            ASSET_INDEX_ENTRY_LEN,
            "asset index",
            AssetIndexEntry::decode,
        )?;

        Ok(Self {
            data,
            header,
            meta,
            node_index,
            asset_index,
        })
    }

    pub fn meta(&self) -> &PackMeta {
        &self.meta
    }

    pub fn format_version(&self) -> u16 {
        self.header.version
    }

    pub fn node_count(&self) -> u32 {
        self.header.node_count
    }

    pub fn asset_count(&self) -> u32 {
        self.header.asset_count
    }

    /// Ordinals of the pack's entry points, read straight from index flags.
    pub fn entry_points(&self) -> Vec<u32> {
        self.node_index
            .iter()
            .enumerate()
            .filter(|(_, e)| e.flags & NODE_FLAG_ENTRY_POINT != 0)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Decode just the id of the node at `ordinal`.
    pub fn node_id(&self, ordinal: u32) -> Result<NodeId, FormatError> {
        let record = self.record_slice(ordinal)?;
        let (id, _) = decode_id(record)?;
        Ok(id)
    }

    /// Decode the full node at `ordinal`.
    pub fn node(&self, ordinal: u32) -> Result<PackNode, FormatError> {
        let entry = self
            .node_index
            .get(ordinal as usize)
            .ok_or_else(|| FormatError::CorruptIndex(format!("node ordinal {}", ordinal)))?;
        let record = self.record_slice(ordinal)?;
        self.decode_record(record, entry.flags)
    }

    /// Binary search the id-sorted index. O(log n) id reads, no scan.
    pub fn node_by_id(&self, id: &NodeId) -> Result<Option<PackNode>, FormatError> {
        let mut lo = 0u32;
        let mut hi = self.header.node_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_id = self.node_id(mid)?;
            match mid_id.cmp(id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return self.node(mid).map(Some),
            }
        }
        Ok(None)
    }

    /// Decode every node, in index order.
    pub fn nodes(&self) -> Result<Vec<PackNode>, FormatError> {
        (0..self.header.node_count).map(|i| self.node(i)).collect()
    }

    /// Fetch an asset payload, verifying it against the hash stored in the
    /// index.
    pub fn asset(&self, ordinal: u32) -> Result<(AssetKind, &[u8]), FormatError> {
        let entry = self
            .asset_index
            .get(ordinal as usize)
            .ok_or_else(|| FormatError::CorruptIndex(format!("asset ordinal {}", ordinal)))?;
        let start = entry.blob_off as usize;
        let end = start + entry.blob_len as usize;
        let bytes = self
            .data
            .get(start..end)
            .ok_or(FormatError::Truncated("asset blob"))?;

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        if hasher.finalize().as_slice() != entry.content_hash {
            return Err(FormatError::CorruptAsset { ordinal });
        }

        let kind = decode_asset_kind(entry.kind, ordinal)?;
        Ok((kind, bytes))
    }

    /// Hex content hash of the asset at `ordinal`.
    pub fn asset_hash(&self, ordinal: u32) -> Result<String, FormatError> {
        let entry = self
            .asset_index
            .get(ordinal as usize)
            .ok_or_else(|| FormatError::CorruptIndex(format!("asset ordinal {}", ordinal)))?;
        Ok(hex::encode(entry.content_hash))
    }

    pub fn asset_entry(&self, ordinal: u32) -> Option<&AssetIndexEntry> {
        self.asset_index.get(ordinal as usize)
    }

    /// Reconstruct the full in-memory pack, verifying every asset. This is
    /// the inverse of serialization and the basis of the round-trip tests.
    pub fn to_pack(&self) -> Result<Pack, FormatError> {
        let nodes = self.nodes()?;
        let mut assets = Vec::with_capacity(self.asset_index.len());
        for i in 0..self.header.asset_count {
            let (kind, bytes) = self.asset(i)?;
            assets.push(PackAsset {
                kind,
                content_hash: self.asset_hash(i)?,
                bytes: bytes.to_vec(),
            });
        }
        Ok(Pack {
            meta: self.meta.clone(),
            nodes,
            assets,
        })
    }

    fn record_slice(&self, ordinal: u32) -> Result<&[u8], FormatError> {
        let entry = self
            .node_index
            .get(ordinal as usize)
            .ok_or_else(|| FormatError::CorruptIndex(format!("node ordinal {}", ordinal)))?;
        let start = entry.record_off as usize;
        let end = start + entry.record_len as usize;
        self.data
            .get(start..end)
            .ok_or(FormatError::Truncated("node record"))
    }

    fn decode_record(&self, record: &[u8], flags: u32) -> Result<PackNode, FormatError> {
        let (id, rest) = decode_id(record)?;

        if rest.len() < 10 {
            return Err(FormatError::Truncated("node record body"));
        }
        let audio = decode_asset_slot(i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]))?;
        let image = decode_asset_slot(i32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]))?;
        let transition_count = u16::from_le_bytes([rest[8], rest[9]]) as usize;

        let mut transitions = Vec::with_capacity(transition_count);
        let mut cursor = &rest[10..];
        for _ in 0..transition_count {
            if cursor.len() < 9 {
                return Err(FormatError::Truncated("transition"));
            }
            let target_ordinal = u32::from_le_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]);
            let kind = cursor[4];
            let value = u32::from_le_bytes([cursor[5], cursor[6], cursor[7], cursor[8]]);
            let trigger = match kind {
                TRIGGER_KIND_AUTO => Trigger::AutoAdvance,
                TRIGGER_KIND_CHOICE => Trigger::Choice { index: value },
                TRIGGER_KIND_TIMEOUT => Trigger::Timeout { seconds: value },
                other => {
                    return Err(FormatError::CorruptIndex(format!(
                        "unknown trigger kind {}",
                        other
                    )))
                }
            };
            transitions.push(Transition {
                target: self.node_id(target_ordinal)?,
                trigger,
            });
            cursor = &cursor[9..];
        }

        let audio = match audio {
            Some(ordinal) => Some(self.asset_hash(ordinal)?),
            None => None,
        };
        let image = match image {
            Some(ordinal) => Some(self.asset_hash(ordinal)?),
            None => None,
        };

        Ok(PackNode {
            id,
            entry_point: flags & NODE_FLAG_ENTRY_POINT != 0,
            terminal: flags & NODE_FLAG_TERMINAL != 0,
            audio,
            image,
            transitions,
        })
    }
}

fn read_table<T>(
    data: &[u8],
    off: u64,
    count: usize,
    entry_len: usize,
    what: &'static str,
    decode: impl Fn(&[u8]) -> Result<T, FormatError>,
) -> Result<Vec<T>, FormatError> {
    let start = off as usize;
    let end = start
        .checked_add(count.checked_mul(entry_len).ok_or(FormatError::Truncated(what))?)
        .ok_or(FormatError::Truncated(what))?;
    let table = data.get(start..end).ok_or(FormatError::Truncated(what))?;
    table.chunks(entry_len).map(|chunk| decode(chunk)).collect()
}

fn decode_id(record: &[u8]) -> Result<(NodeId, &[u8]), FormatError> {
    if record.len() < 2 {
        return Err(FormatError::Truncated("node id length"));
    }
    let id_len = u16::from_le_bytes([record[0], record[1]]) as usize;
    let id_end = 2 + id_len;
    let id_bytes = record
        .get(2..id_end)
        .ok_or(FormatError::Truncated("node id"))?;
    let id = std::str::from_utf8(id_bytes)
        .map_err(|_| FormatError::CorruptIndex("node id is not UTF-8".into()))?;
    Ok((NodeId::new(id), &record[id_end..]))
}

fn decode_asset_slot(slot: i32) -> Result<Option<u32>, FormatError> {
    if slot == NO_ASSET {
        return Ok(None);
    }
    u32::try_from(slot)
        .map(Some)
        .map_err(|_| FormatError::CorruptIndex(format!("asset slot {}", slot)))
}

fn decode_asset_kind(kind: u8, ordinal: u32) -> Result<AssetKind, FormatError> {
    match kind {
        ASSET_KIND_AUDIO => Ok(AssetKind::Audio),
        ASSET_KIND_IMAGE => Ok(AssetKind::Image),
        other => Err(FormatError::CorruptIndex(format!(
            "unknown asset kind {} at ordinal {}",
            other, ordinal
        ))),
    }
}
