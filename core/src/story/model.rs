//! Story data model: nodes, transitions, pack metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a story node. Unique within a pack and preserved
/// across recompiles so cached narration stays attached to its node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How playback moves across a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Follow as soon as the node's narration finishes.
    AutoAdvance,
    /// Follow when the listener picks option `index` (0-based).
    Choice { index: u32 },
    /// Follow after `seconds` of inactivity.
    Timeout { seconds: u32 },
}

impl Trigger {
    /// Choice transitions are the only ones requiring a user action, which
    /// is what makes a loop escapable.
    pub fn is_choice(&self) -> bool {
        matches!(self, Trigger::Choice { .. })
    }
}

/// A directed edge from the node that owns it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub target: NodeId,
    pub trigger: Trigger,
}

/// One narrated unit of the story.
///
/// A node carries either narration `text` (synthesized), a pre-recorded
/// `audio` file reference, or neither (a silent menu node). Asset paths are
/// resolved relative to the script file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoryNode {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub entry_point: bool,
    #[serde(default)]
    pub terminal: bool,
}

impl StoryNode {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            text: None,
            audio: None,
            image: None,
            transitions: Vec::new(),
            entry_point: false,
            terminal: false,
        }
    }

    /// True when the node needs narration synthesized (text and no
    /// pre-recorded audio).
    pub fn needs_synthesis(&self) -> bool {
        self.audio.is_none() && self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Pack-level metadata carried through serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackMeta {
    pub title: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_version")]
    pub version: u16,
    #[serde(default)]
    pub description: String,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_version() -> u16 {
    1
}

impl Default for PackMeta {
    fn default() -> Self {
        Self {
            title: String::new(),
            language: default_language(),
            version: default_version(),
            description: String::new(),
        }
    }
}
