//! Story graph validation and indexing.
//!
//! `StoryGraph::build` is the gate between author input and the compiler:
//! everything past it can assume ids are unique, every transition resolves,
//! and playback cannot get stuck in a loop the listener has no way out of.

use crate::story::model::{NodeId, PackMeta, StoryNode};
use crate::story::raw::RawStory;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// Display/Error are implemented by hand: thiserror would treat the
// `source` field of `DanglingTransition` as an error source, but it is a
// node id, and the field name is part of the public API.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    DuplicateNodeId { id: NodeId },

    DanglingTransition { source: NodeId, target: NodeId },

    NoEntryPoint,

    UnreachableNode { ids: Vec<NodeId> },

    UnescapableCycle { ids: Vec<NodeId> },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateNodeId { id } => write!(f, "Duplicate node id: \"{}\"", id),
            GraphError::DanglingTransition { source, target } => write!(
                f,
                "Transition from \"{}\" targets unknown node \"{}\"",
                source, target
            ),
            GraphError::NoEntryPoint => write!(f, "Story has no entry point"),
            GraphError::UnreachableNode { ids } => write!(
                f,
                "Nodes unreachable from any entry point: {}",
                join_ids(ids)
            ),
            GraphError::UnescapableCycle { ids } => {
                write!(f, "Cycle with no user-choice escape: {}", join_ids(ids))
            }
        }
    }
}

impl std::error::Error for GraphError {}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(|i| i.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The validated, indexed form of a story. Immutable once built.
#[derive(Clone, Debug)]
pub struct StoryGraph {
    meta: PackMeta,
    nodes: Vec<StoryNode>,
    index: HashMap<NodeId, usize>,
    entry_points: Vec<NodeId>,
    base_dir: PathBuf,
}

impl StoryGraph {
    /// Validate a raw script into a graph, or report the first defect found.
    ///
    /// Checks run in order: duplicate ids, dangling transition targets,
    /// entry-point presence, reachability from the entry-point set, and
    /// finally cycle escapability. Unreachable nodes are all reported
    /// together so the author fixes them in one pass.
    pub fn build(raw: RawStory) -> Result<Self, GraphError> {
        let RawStory {
            meta,
            nodes,
            base_dir,
        } = raw;

        let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNodeId {
                    id: node.id.clone(),
                });
            }
        }

        for node in &nodes {
            for t in &node.transitions {
                if !index.contains_key(&t.target) {
                    return Err(GraphError::DanglingTransition {
                        source: node.id.clone(),
                        target: t.target.clone(),
                    });
                }
            }
        }

        let entry_points: Vec<NodeId> = nodes
            .iter()
            .filter(|n| n.entry_point)
            .map(|n| n.id.clone())
            .collect();
        if entry_points.is_empty() {
            return Err(GraphError::NoEntryPoint);
        }

        let unreachable = find_unreachable(&nodes, &index, &entry_points);
        if !unreachable.is_empty() {
            return Err(GraphError::UnreachableNode { ids: unreachable });
        }

        if let Some(cycle) = find_unescapable_cycle(&nodes, &index) {
            return Err(GraphError::UnescapableCycle { ids: cycle });
        }

        info!(
            target = "graph",
            nodes = nodes.len(),
            entry_points = entry_points.len(),
            "Story graph validated"
        );
        Ok(Self {
            meta,
            nodes,
            index,
            entry_points,
            base_dir,
        })
    }

    pub fn meta(&self) -> &PackMeta {
        &self.meta
    }

    pub fn nodes(&self) -> &[StoryNode] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&StoryNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn entry_points(&self) -> &[NodeId] {
        &self.entry_points
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
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

/// Breadth-first reachability from the whole entry-point set. Returns the
/// ids of nodes no entry point can reach, sorted for stable reporting.
fn find_unreachable(
    nodes: &[StoryNode],
    index: &HashMap<NodeId, usize>,
    entry_points: &[NodeId],
) -> Vec<NodeId> {
    let mut seen = vec![false; nodes.len()];
    let mut queue: VecDeque<usize> = VecDeque::new();
    for id in entry_points {
        if let Some(&i) = index.get(id) {
            if !seen[i] {
                seen[i] = true;
                queue.push_back(i);
            }
        }
    }

    while let Some(v) = queue.pop_front() {
        for t in &nodes[v].transitions {
            if let Some(&w) = index.get(&t.target) {
                if !seen[w] {
                    seen[w] = true;
                    queue.push_back(w);
                }
            }
        }
    }

    let mut unreachable: Vec<NodeId> = nodes
        .iter()
        .zip(seen.iter())
        .filter(|(_, &s)| !s)
        .map(|(n, _)| n.id.clone())
        .collect();
    unreachable.sort();
    unreachable
}

/// Look for a cycle the listener cannot break out of.
///
/// A node with any outgoing choice transition hands control to the listener,
/// so every cycle through it is escapable. What remains is the subgraph of
/// choice-free nodes and their auto-advance/timeout edges; any cycle in that
/// subgraph plays forever on its own. Returns the nodes on the first such
/// cycle found, in path order.
fn find_unescapable_cycle(
    nodes: &[StoryNode],
    index: &HashMap<NodeId, usize>,
) -> Option<Vec<NodeId>> {
    let choice_free: Vec<bool> = nodes
        .iter()
        .map(|n| !n.transitions.iter().any(|t| t.trigger.is_choice()))
        .collect();

    let adj: Vec<Vec<usize>> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| {
            if !choice_free[i] {
                return Vec::new();
            }
            n.transitions
                .iter()
                .filter_map(|t| index.get(&t.target).copied())
                .filter(|&j| choice_free[j])
                .collect()
        })
        .collect();

    // Iterative DFS; gray nodes are exactly the current path.
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;
    let mut color = vec![WHITE; nodes.len()];

    for start in 0..nodes.len() {
        if color[start] != WHITE || !choice_free[start] {
            continue;
        }
        let mut path: Vec<usize> = vec![start];
        let mut cursor: Vec<usize> = vec![0];
        color[start] = GRAY;

        while let (Some(&v), Some(next)) = (path.last(), cursor.last_mut()) {
            if *next < adj[v].len() {
                let w = adj[v][*next];
                *next += 1;
                match color[w] {
                    WHITE => {
                        color[w] = GRAY;
                        path.push(w);
                        cursor.push(0);
                    }
                    GRAY => {
                        let pos = path.iter().position(|&x| x == w).unwrap_or(0);
                        let cycle: Vec<NodeId> =
                            path[pos..].iter().map(|&x| nodes[x].id.clone()).collect();
                        debug!(
                            target = "graph",
                            cycle = %join_ids(&cycle),
                            "Found auto-advance cycle without escape"
                        );
                        return Some(cycle);
                    }
                    _ => {}
                }
            } else {
                color[v] = BLACK;
                path.pop();
                cursor.pop();
            }
        }
    }
    None
}
