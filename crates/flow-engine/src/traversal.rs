//! Start/End connectivity analysis
//!
//! Two breadth-first passes over adjacency lists built once per call: a
//! forward pass from every Start node and a backward pass from every End
//! node. Edges whose endpoints are missing are ignored.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{FlowEdge, FlowNode, NodeId, NodeType};

/// Reachability facts for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnectivity {
    pub is_connected_to_start: bool,
    pub is_connected_to_end: bool,
    /// Number of Agent nodes passed before reaching this node, for every
    /// distinct count observed on walks from Start. Sorted, deduplicated.
    pub agent_positions: Vec<usize>,
}

impl NodeConnectivity {
    /// Whether the node lies on a Start-to-End path
    pub fn is_on_path(&self) -> bool {
        self.is_connected_to_start && self.is_connected_to_end
    }
}

/// Connectivity of every node in a graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityMap {
    nodes: HashMap<NodeId, NodeConnectivity>,
}

impl ConnectivityMap {
    pub fn get(&self, node_id: &str) -> Option<&NodeConnectivity> {
        self.nodes.get(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeConnectivity)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a node's fields must validate: it sits between Start and End
    pub fn requires_field_validation(&self, node_id: &str) -> bool {
        self.get(node_id).is_some_and(NodeConnectivity::is_on_path)
    }

    /// Ids of nodes not on any Start-to-End path, sorted
    pub fn disconnected(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .nodes
            .iter()
            .filter(|(_, c)| !c.is_on_path())
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Compute per-node connectivity in O(V + E)
pub fn compute_connectivity(nodes: &[FlowNode], edges: &[FlowEdge]) -> ConnectivityMap {
    let types: HashMap<&str, NodeType> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.node_type()))
        .collect();

    let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut backward: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        if !types.contains_key(edge.source.as_str()) || !types.contains_key(edge.target.as_str()) {
            log::debug!("Ignoring dangling edge '{}'", edge.id);
            continue;
        }
        forward.entry(&edge.source).or_default().push(&edge.target);
        backward.entry(&edge.target).or_default().push(&edge.source);
    }

    let starts = ids_of_type(&types, NodeType::Start);
    let ends = ids_of_type(&types, NodeType::End);

    let from_start = reachable(&starts, &forward);
    let to_end = reachable(&ends, &backward);
    let positions = agent_positions(&starts, &forward, &types);

    let nodes = types
        .keys()
        .map(|&id| {
            let connectivity = NodeConnectivity {
                is_connected_to_start: from_start.contains(id),
                is_connected_to_end: to_end.contains(id),
                agent_positions: positions
                    .get(id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default(),
            };
            (id.to_string(), connectivity)
        })
        .collect();

    ConnectivityMap { nodes }
}

fn ids_of_type<'a>(types: &HashMap<&'a str, NodeType>, node_type: NodeType) -> Vec<&'a str> {
    types
        .iter()
        .filter(|(_, t)| **t == node_type)
        .map(|(id, _)| *id)
        .collect()
}

fn reachable<'a>(roots: &[&'a str], adjacency: &HashMap<&'a str, Vec<&'a str>>) -> HashSet<&'a str> {
    let mut visited: HashSet<&str> = roots.iter().copied().collect();
    let mut queue: VecDeque<&str> = roots.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        for &next in adjacency.get(id).map(Vec::as_slice).unwrap_or_default() {
            if visited.insert(next) {
                queue.push_back(next);
            }
        }
    }
    visited
}

/// BFS over `(node, agents passed)` states. Counts are capped at the number
/// of Agent nodes, so cycles terminate.
fn agent_positions<'a>(
    starts: &[&'a str],
    forward: &HashMap<&'a str, Vec<&'a str>>,
    types: &HashMap<&'a str, NodeType>,
) -> HashMap<&'a str, BTreeSet<usize>> {
    let agent_count = types.values().filter(|t| **t == NodeType::Agent).count();
    let mut seen: HashSet<(&str, usize)> = HashSet::new();
    let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
    let mut positions: HashMap<&str, BTreeSet<usize>> = HashMap::new();

    for &start in starts {
        if seen.insert((start, 0)) {
            queue.push_back((start, 0));
        }
    }

    while let Some((id, count)) = queue.pop_front() {
        positions.entry(id).or_default().insert(count);

        let passed = count + usize::from(types.get(id) == Some(&NodeType::Agent));
        if passed > agent_count {
            continue;
        }
        for &next in forward.get(id).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert((next, passed)) {
                queue.push_back((next, passed));
            }
        }
    }
    positions
}

/// Hash of everything traversal depends on: node ids and types, edge ids,
/// endpoints and handles. Positions and payloads are excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructuralFingerprint(String);

impl StructuralFingerprint {
    /// Order-insensitive fingerprint of a graph's structure
    pub fn of(nodes: &[FlowNode], edges: &[FlowEdge]) -> Self {
        let mut node_keys: Vec<String> = nodes
            .iter()
            .map(|n| format!("n\u{1f}{}\u{1f}{}", n.id, n.node_type()))
            .collect();
        node_keys.sort_unstable();

        let mut edge_keys: Vec<String> = edges
            .iter()
            .map(|e| {
                format!(
                    "e\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
                    e.id,
                    e.source,
                    e.target,
                    e.source_handle.as_deref().unwrap_or_default(),
                    e.target_handle.as_deref().unwrap_or_default()
                )
            })
            .collect();
        edge_keys.sort_unstable();

        let mut hasher = blake3::Hasher::new();
        for key in node_keys.iter().chain(edge_keys.iter()) {
            hasher.update(key.as_bytes());
            hasher.update(b"\x1e");
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hit/miss counters of a [`TraversalCache`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, (StructuralFingerprint, Arc<ConnectivityMap>)>,
    stats: CacheStats,
}

/// Connectivity results memoized per flow id.
///
/// An entry is reused only while the graph's structural fingerprint is
/// unchanged. Entries never expire on their own.
#[derive(Debug, Default)]
pub struct TraversalCache {
    inner: Mutex<CacheInner>,
}

impl TraversalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached connectivity for `flow_id`, recomputing when the
    /// structure has changed since it was stored
    pub fn get_or_compute(
        &self,
        flow_id: &str,
        nodes: &[FlowNode],
        edges: &[FlowEdge],
    ) -> Arc<ConnectivityMap> {
        let fingerprint = StructuralFingerprint::of(nodes, edges);
        let mut inner = self.inner.lock();

        if let Some((stored, map)) = inner.entries.get(flow_id) {
            if *stored == fingerprint {
                let map = Arc::clone(map);
                inner.stats.hits += 1;
                return map;
            }
        }

        log::debug!("Computing connectivity for flow '{}'", flow_id);
        let map = Arc::new(compute_connectivity(nodes, edges));
        inner
            .entries
            .insert(flow_id.to_string(), (fingerprint, Arc::clone(&map)));
        inner.stats.misses += 1;
        map
    }

    /// Drop the entry for one flow
    pub fn invalidate(&self, flow_id: &str) -> bool {
        self.inner.lock().entries.remove(flow_id).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}
