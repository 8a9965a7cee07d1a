//! Binary container framing.
//!
//! All integers are little-endian. The container is laid out so a reader
//! with almost no memory can find any node without scanning:
//!
//! ```text
//! header        40 bytes  magic, version, counts, index offsets, meta len
//! meta block    JSON-encoded PackMeta
//! node index    node_count x 16 bytes, sorted by node id
//! node records  variable length, addressed only through the index
//! asset index   asset_count x 48 bytes, sorted by content hash
//! asset blobs   deduplicated payloads, addressed through the asset index
//! ```
//!
//! Node records reference assets and other nodes by index ordinal, never by
//! repeated string id, which keeps records small and lookups O(1) once the
//! two fixed-size index tables are loaded.

use thiserror::Error;

pub const PACK_MAGIC: [u8; 4] = *b"SPK1";
pub const FORMAT_VERSION: u16 = 1;

pub const HEADER_LEN: usize = 40;
pub const NODE_INDEX_ENTRY_LEN: usize = 16;
pub const ASSET_INDEX_ENTRY_LEN: usize = 48;

pub const NODE_FLAG_ENTRY_POINT: u32 = 1 << 0;
pub const NODE_FLAG_TERMINAL: u32 = 1 << 1;

pub const TRIGGER_KIND_AUTO: u8 = 0;
pub const TRIGGER_KIND_CHOICE: u8 = 1;
pub const TRIGGER_KIND_TIMEOUT: u8 = 2;

pub const ASSET_KIND_AUDIO: u8 = 0;
pub const ASSET_KIND_IMAGE: u8 = 1;

/// No-asset marker in a node record's audio/image slot.
pub const NO_ASSET: i32 = -1;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Not a story pack (bad magic)")]
    BadMagic,

    #[error("Unsupported pack format version {found}")]
    UnsupportedVersion { found: u16 },

    #[error("Truncated pack while reading {0}")]
    Truncated(&'static str),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Corrupt metadata: {0}")]
    CorruptMeta(String),

    #[error("Asset {ordinal} payload does not match its stored hash")]
    CorruptAsset { ordinal: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u16,
    pub node_count: u32,
    pub asset_count: u32,
    pub node_index_off: u64,
    pub asset_index_off: u64,
    pub meta_len: u32,
}

impl PackHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&PACK_MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        // bytes 6..8 reserved flags
        out[8..12].copy_from_slice(&self.node_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.asset_count.to_le_bytes());
        out[16..24].copy_from_slice(&self.node_index_off.to_le_bytes());
        out[24..32].copy_from_slice(&self.asset_index_off.to_le_bytes());
        out[32..36].copy_from_slice(&self.meta_len.to_le_bytes());
        // bytes 36..40 reserved
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_LEN {
            return Err(FormatError::Truncated("header"));
        }
        if bytes[0..4] != PACK_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion { found: version });
        }
        Ok(Self {
            version,
            node_count: read_u32(bytes, 8),
            asset_count: read_u32(bytes, 12),
            node_index_off: read_u64(bytes, 16),
            asset_index_off: read_u64(bytes, 24),
            meta_len: read_u32(bytes, 32),
        })
    }
}

/// Fixed-size node index entry: where the record lives and its flags, so
/// entry points are discoverable without decoding any record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeIndexEntry {
    pub record_off: u64,
    pub record_len: u32,
    pub flags: u32,
}

impl NodeIndexEntry {
    pub fn encode(&self) -> [u8; NODE_INDEX_ENTRY_LEN] {
        let mut out = [0u8; NODE_INDEX_ENTRY_LEN];
        out[0..8].copy_from_slice(&self.record_off.to_le_bytes());
        out[8..12].copy_from_slice(&self.record_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < NODE_INDEX_ENTRY_LEN {
            return Err(FormatError::Truncated("node index entry"));
        }
        Ok(Self {
            record_off: read_u64(bytes, 0),
            record_len: read_u32(bytes, 8),
            flags: read_u32(bytes, 12),
        })
    }
}

/// Fixed-size asset index entry carrying the payload's content hash for
/// post-read verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssetIndexEntry {
    pub blob_off: u64,
    pub blob_len: u32,
    pub kind: u8,
    pub content_hash: [u8; 32],
}

impl AssetIndexEntry {
    pub fn encode(&self) -> [u8; ASSET_INDEX_ENTRY_LEN] {
        let mut out = [0u8; ASSET_INDEX_ENTRY_LEN];
        out[0..8].copy_from_slice(&self.blob_off.to_le_bytes());
        out[8..12].copy_from_slice(&self.blob_len.to_le_bytes());
        out[12] = self.kind;
        // bytes 13..16 reserved
        out[16..48].copy_from_slice(&self.content_hash);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < ASSET_INDEX_ENTRY_LEN {
            return Err(FormatError::Truncated("asset index entry"));
        }
        let mut content_hash = [0u8; 32];
        content_hash.copy_from_slice(&bytes[16..48]);
        Ok(Self {
            blob_off: read_u64(bytes, 0),
            blob_len: read_u32(bytes, 8),
            kind: bytes[12],
            content_hash,
        })
    }
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        bytes[off],
        bytes[off + 1],
        bytes[off + 2],
        bytes[off + 3],
        bytes[off + 4],
        bytes[off + 5],
        bytes[off + 6],
        bytes[off + 7],
    ])
}
