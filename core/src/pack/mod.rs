// Binary pack container: in-memory model, serializer, reader

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{FormatError, FORMAT_VERSION, PACK_MAGIC};
pub use reader::PackReader;
pub use writer::{serialize, serialize_to_vec, write_pack_file, SerializationError};

use crate::store::AssetKind;
use crate::story::{NodeId, PackMeta, Transition};

/// A resolved asset carried by a pack. `content_hash` is the hex SHA-256 of
/// `bytes` and doubles as the asset's identity everywhere in the compiler.
#[derive(Clone, Debug, PartialEq)]
pub struct PackAsset {
    pub kind: AssetKind,
    pub content_hash: String,
    pub bytes: Vec<u8>,
}

/// A node ready for serialization: narration and artwork resolved to stored
/// assets, transitions still expressed by node id (the serializer turns them
/// into index ordinals).
#[derive(Clone, Debug, PartialEq)]
pub struct PackNode {
    pub id: NodeId,
    pub entry_point: bool,
    pub terminal: bool,
    pub audio: Option<String>,
    pub image: Option<String>,
    pub transitions: Vec<Transition>,
}

/// The complete compile product. Constructed once per run from a validated
/// graph; immutable once serialized.
#[derive(Clone, Debug, PartialEq)]
pub struct Pack {
    pub meta: PackMeta,
    pub nodes: Vec<PackNode>,
    pub assets: Vec<PackAsset>,
}

impl Pack {
    pub fn new(meta: PackMeta) -> Self {
        Self {
            meta,
            nodes: Vec::new(),
            assets: Vec::new(),
        }
    }
}
