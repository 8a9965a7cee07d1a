//! Author-facing script input.
//!
//! A script is a single JSON document:
//!
//! ```json
//! {
//!   "meta": { "title": "The Lost Map", "language": "en" },
//!   "nodes": [
//!     {
//!       "id": "start",
//!       "text": "You find a dusty map...",
//!       "entry_point": true,
//!       "transitions": [
//!         { "target": "cave", "trigger": { "kind": "choice", "index": 0 } },
//!         { "target": "forest", "trigger": { "kind": "choice", "index": 1 } }
//!       ]
//!     }
//!   ]
//! }
//! ```

use crate::story::model::{PackMeta, StoryNode};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The parsed but not yet validated script.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawStory {
    pub meta: PackMeta,
    pub nodes: Vec<StoryNode>,
    /// Directory asset paths are resolved against. Set when loading from
    /// disk; defaults to the current directory for in-memory scripts.
    #[serde(skip, default = "default_base_dir")]
    pub base_dir: PathBuf,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

impl RawStory {
    pub fn new(meta: PackMeta, nodes: Vec<StoryNode>) -> Self {
        Self {
            meta,
            nodes,
            base_dir: default_base_dir(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let story: RawStory = serde_json::from_str(json)?;
        Ok(story)
    }

    /// Load a script file; asset references become relative to its parent
    /// directory.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut story = Self::from_json(&json)?;
        if let Some(parent) = path.parent() {
            story.base_dir = parent.to_path_buf();
        }
        Ok(story)
    }

    /// Resolve a node's asset reference against the script directory.
    pub fn resolve_asset(&self, reference: &str) -> PathBuf {
        let p = Path::new(reference);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}
