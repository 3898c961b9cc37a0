//! Targeted updates
//!
//! Editors send partial node payloads and whole node lists that may carry
//! stale data for nodes they did not mean to touch. These merges keep the
//! stored data authoritative except where the caller explicitly changed it.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{FlowEngineError, Result};
use crate::types::{json_kind, FlowEdge, FlowNode, NodeData};

/// Shallow-merge `patch` into a node's data payload.
///
/// Keys set to `null` are removed; every other key replaces the stored
/// value wholesale, so list-valued keys never accumulate. The merged
/// payload is re-validated against the node's type.
pub fn merge_node_data(node: &FlowNode, patch: &Value) -> Result<FlowNode> {
    let Value::Object(patch) = patch else {
        return Err(FlowEngineError::type_mismatch(
            &node.id,
            "object patch",
            json_kind(patch),
        ));
    };

    let node_type = node.node_type();
    let reference_key = node_type.reference_key();
    let mut merged = match node.data.to_value() {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    for (key, value) in patch {
        if value.is_null() {
            if Some(key.as_str()) == reference_key {
                return Err(FlowEngineError::type_mismatch(
                    &node.id,
                    format!("string '{}'", key),
                    "null",
                ));
            }
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }

    let data = NodeData::from_value(node_type, &node.id, Value::Object(merged))?;
    Ok(FlowNode {
        data,
        ..node.clone()
    })
}

/// Merge an incoming node list against the stored one.
///
/// Retained nodes keep their stored data and take only layout fields
/// (position, deletable, z-index) from the incoming node. New nodes are taken
/// as sent. Nodes missing from `incoming` are dropped. A retained id whose
/// type changed is treated as a new node.
pub fn merge_nodes(existing: &[FlowNode], incoming: Vec<FlowNode>) -> Vec<FlowNode> {
    let stored: HashMap<&str, &FlowNode> = existing.iter().map(|n| (n.id.as_str(), n)).collect();

    incoming
        .into_iter()
        .map(|node| match stored.get(node.id.as_str()) {
            Some(current) if current.node_type() == node.node_type() => FlowNode {
                data: current.data.clone(),
                ..node
            },
            Some(current) => {
                log::debug!(
                    "Node '{}' changed type {} -> {}, taking incoming data",
                    node.id,
                    current.node_type(),
                    node.node_type()
                );
                node
            }
            None => node,
        })
        .collect()
}

/// Merge an editor's node list and take its edge list wholesale
pub fn merge_nodes_and_edges(
    existing: &[FlowNode],
    incoming_nodes: Vec<FlowNode>,
    incoming_edges: Vec<FlowEdge>,
) -> (Vec<FlowNode>, Vec<FlowEdge>) {
    (merge_nodes(existing, incoming_nodes), incoming_edges)
}
