//! Content-addressed asset store.
//!
//! Every payload lives once under `objects/<sha256-hex>`, whatever node or
//! run produced it. A second index maps recipe hashes (what a node asked
//! for: text, voice, profile) to the content hash that request produced,
//! which is what lets a recompile skip synthesis and encoding entirely.
//!
//! Concurrent workers may insert the same payload at the same time; both
//! compute the same hash, both write byte-identical temp files, and the
//! rename is atomic, so whichever lands last changes nothing.
//!
//! Layout on disk:
//! - `<root>/objects/<hash>`: raw payloads
//! - `<root>/manifest.json`: asset entries + recipe index, rewritten on flush

use crate::util::gen_id;
use crate::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFEST_VERSION: u32 = 1;

/// Media kind of a stored payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Audio,
    Image,
}

/// Index entry for one stored payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAsset {
    pub content_hash: String,
    pub kind: AssetKind,
    pub len: u64,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct StoreManifest {
    version: u32,
    assets: Vec<StoredAsset>,
    recipes: HashMap<String, String>,
}

/// De-duplicated blob store shared by all compile workers.
pub struct AssetStore {
    root: PathBuf,
    objects_dir: PathBuf,
    assets: DashMap<String, StoredAsset>,
    recipes: DashMap<String, String>,
}

impl AssetStore {
    /// Open (or create) a store rooted at `root`, loading any manifest a
    /// previous run left behind. Manifest entries whose object file has
    /// gone missing are dropped with a warning.
    pub fn open(root: &Path) -> Result<Self> {
        let objects_dir = root.join("objects");
        std::fs::create_dir_all(&objects_dir)?;

        let store = Self {
            root: root.to_path_buf(),
            objects_dir,
            assets: DashMap::new(),
            recipes: DashMap::new(),
        };

        let manifest_path = store.manifest_path();
        if manifest_path.exists() {
            let json = std::fs::read_to_string(&manifest_path)?;
            match serde_json::from_str::<StoreManifest>(&json) {
                Ok(manifest) => {
                    for asset in manifest.assets {
                        if store.object_path(&asset.content_hash).exists() {
                            store.assets.insert(asset.content_hash.clone(), asset);
                        } else {
                            warn!(
                                target = "store",
                                hash = %asset.content_hash,
                                "Manifest entry has no object file, dropping"
                            );
                        }
                    }
                    for (recipe, content) in manifest.recipes {
                        if store.assets.contains_key(&content) {
                            store.recipes.insert(recipe, content);
                        }
                    }
                }
                Err(e) => {
                    warn!(target = "store", error = %e, "Unreadable manifest, starting fresh");
                }
            }
        }

        info!(
            target = "store",
            root = ?store.root,
            assets = store.assets.len(),
            recipes = store.recipes.len(),
            "Asset store opened"
        );
        Ok(store)
    }

    /// SHA-256 of a payload, hex-encoded. The store's one and only key.
    pub fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Store a payload, returning its index entry. Re-inserting identical
    /// bytes is a no-op that returns the existing entry.
    pub fn insert(&self, kind: AssetKind, bytes: &[u8]) -> Result<StoredAsset> {
        let content_hash = Self::hash_bytes(bytes);
        if let Some(existing) = self.assets.get(&content_hash) {
            debug!(target = "store", hash = %content_hash, "Payload already stored");
            return Ok(existing.clone());
        }

        let dest = self.object_path(&content_hash);
        if !dest.exists() {
            let temp_path = self.objects_dir.join(format!(".{}_{}", content_hash, gen_id()));
            let result = (|| -> std::io::Result<()> {
                std::fs::write(&temp_path, bytes)?;
                std::fs::rename(&temp_path, &dest)?;
                Ok(())
            })();
            if let Err(e) = result {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e.into());
            }
        }

        let asset = StoredAsset {
            content_hash: content_hash.clone(),
            kind,
            len: bytes.len() as u64,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.assets.insert(content_hash, asset.clone());
        Ok(asset)
    }

    /// Fetch a payload by content hash.
    pub fn get(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        if !self.assets.contains_key(content_hash) {
            return Ok(None);
        }
        Ok(Some(std::fs::read(self.object_path(content_hash))?))
    }

    pub fn entry(&self, content_hash: &str) -> Option<StoredAsset> {
        self.assets.get(content_hash).map(|a| a.clone())
    }

    pub fn contains(&self, content_hash: &str) -> bool {
        self.assets.contains_key(content_hash)
    }

    /// Remember that a recipe produced the given stored payload.
    pub fn record_recipe(&self, recipe_hash: &str, content_hash: &str) {
        self.recipes
            .insert(recipe_hash.to_string(), content_hash.to_string());
    }

    /// Look up a prior run's output for this recipe, if its payload is
    /// still present.
    pub fn lookup_recipe(&self, recipe_hash: &str) -> Option<StoredAsset> {
        let content_hash = self.recipes.get(recipe_hash)?.clone();
        self.entry(&content_hash)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Persist the index so the next run starts with a warm cache. Written
    /// to a temp file and renamed, same as the objects.
    pub fn flush(&self) -> Result<()> {
        let mut assets: Vec<StoredAsset> = self.assets.iter().map(|a| a.clone()).collect();
        assets.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        let recipes: HashMap<String, String> = self
            .recipes
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let manifest = StoreManifest {
            version: MANIFEST_VERSION,
            assets,
            recipes,
        };
        let json = serde_json::to_string_pretty(&manifest)?;

        let manifest_path = self.manifest_path();
        let temp_path = self.root.join(format!(".manifest_{}.tmp", gen_id()));
        let result = (|| -> std::io::Result<()> {
            std::fs::write(&temp_path, json.as_bytes())?;
            std::fs::rename(&temp_path, &manifest_path)?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!(target = "store", assets = self.assets.len(), "Manifest flushed");
        Ok(())
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    fn object_path(&self, content_hash: &str) -> PathBuf {
        self.objects_dir.join(content_hash)
    }
}

/// Hash of everything that determines a node's encoded narration. Two nodes
/// with the same text, voice, and profile share one recipe, and therefore
/// one stored asset.
pub fn recipe_hash<V: Serialize, P: Serialize>(
    text: &str,
    voice: &V,
    profile: &P,
) -> Result<String> {
    #[derive(Serialize)]
    struct Recipe<'a, V, P> {
        text: &'a str,
        voice: &'a V,
        profile: &'a P,
    }
    let bytes = serde_json::to_vec(&Recipe {
        text,
        voice,
        profile,
    })?;
    Ok(AssetStore::hash_bytes(&bytes))
}

/// Recipe for re-encoding a pre-recorded narration file: the source bytes
/// stand in for the text.
pub fn file_recipe_hash<P: Serialize>(source_hash: &str, profile: &P) -> Result<String> {
    #[derive(Serialize)]
    struct FileRecipe<'a, P> {
        source: &'a str,
        profile: &'a P,
    }
    let bytes = serde_json::to_vec(&FileRecipe {
        source: source_hash,
        profile,
    })?;
    Ok(AssetStore::hash_bytes(&bytes))
}
