//! Core types for flow graphs
//!
//! A flow node's `data` payload is determined entirely by its `type`.
//! On the wire a node is `{id, type, position, data, deletable?, zIndex?}`;
//! in memory the payload is a tagged [`NodeData`] variant, validated when the
//! node is deserialized rather than at every call site.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowEngineError, Result};

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for an edge
pub type EdgeId = String;

/// Source handle taken by an If node when its conditions hold
pub const HANDLE_TRUE: &str = "true";

/// Source handle taken by an If node when its conditions fail
pub const HANDLE_FALSE: &str = "false";

const MAX_ID_LEN: usize = 128;

/// The type of a flow node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    /// Entry point of the flow. Exactly one per usable graph.
    Start,
    /// Exit point of the flow. Exactly one per usable graph.
    End,
    /// Runs a configured agent.
    Agent,
    /// Branches on a set of conditions.
    If,
    /// Recomputes data-store fields from their logic formulas.
    DataStore,
}

impl NodeType {
    /// Get the available output handles for this node type
    pub fn output_handles(&self) -> Vec<&'static str> {
        match self {
            NodeType::If => vec![HANDLE_TRUE, HANDLE_FALSE],
            NodeType::End => vec![],
            _ => vec!["next"],
        }
    }

    /// Get a human-readable label for this node type
    pub fn label(&self) -> &'static str {
        match self {
            NodeType::Start => "Start",
            NodeType::End => "End",
            NodeType::Agent => "Agent",
            NodeType::If => "If",
            NodeType::DataStore => "Data Store",
        }
    }

    /// Whether nodes of this type reference a separately persisted resource
    pub fn references_resource(&self) -> bool {
        matches!(self, NodeType::Agent | NodeType::If | NodeType::DataStore)
    }

    /// Name of the payload key holding the resource reference
    pub fn reference_key(&self) -> Option<&'static str> {
        match self {
            NodeType::Agent => Some("agentId"),
            NodeType::If => Some("ifNodeId"),
            NodeType::DataStore => Some("dataStoreNodeId"),
            NodeType::Start | NodeType::End => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Canvas position of a node
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Payload for Start and End nodes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Editor-only keys carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload for Agent nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNodeData {
    /// Id of the referenced agent resource
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload for If nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfNodeData {
    /// Id of the referenced if-node configuration
    pub if_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload for DataStore nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreNodeData {
    /// Id of the referenced data-store node configuration
    pub data_store_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Type-specific node payload
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Start(TerminalNodeData),
    End(TerminalNodeData),
    Agent(AgentNodeData),
    If(IfNodeData),
    DataStore(DataStoreNodeData),
}

impl NodeData {
    /// The node type this payload belongs to
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::Start(_) => NodeType::Start,
            NodeData::End(_) => NodeType::End,
            NodeData::Agent(_) => NodeType::Agent,
            NodeData::If(_) => NodeType::If,
            NodeData::DataStore(_) => NodeType::DataStore,
        }
    }

    /// Id of the referenced resource, for Agent/If/DataStore payloads
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            NodeData::Agent(d) => Some(&d.agent_id),
            NodeData::If(d) => Some(&d.if_node_id),
            NodeData::DataStore(d) => Some(&d.data_store_node_id),
            NodeData::Start(_) | NodeData::End(_) => None,
        }
    }

    /// Point the payload at a different resource. No-op for Start/End.
    pub fn set_resource_id(&mut self, id: impl Into<String>) {
        match self {
            NodeData::Agent(d) => d.agent_id = id.into(),
            NodeData::If(d) => d.if_node_id = id.into(),
            NodeData::DataStore(d) => d.data_store_node_id = id.into(),
            NodeData::Start(_) | NodeData::End(_) => {}
        }
    }

    /// Optional display label
    pub fn label(&self) -> Option<&str> {
        match self {
            NodeData::Start(d) | NodeData::End(d) => d.label.as_deref(),
            NodeData::Agent(d) => d.label.as_deref(),
            NodeData::If(d) => d.label.as_deref(),
            NodeData::DataStore(d) => d.label.as_deref(),
        }
    }

    /// Build a payload for `node_type` from a raw JSON value.
    ///
    /// Documents written before the resource reference became explicit may
    /// omit it; in that case the node id is used once, here, at the
    /// persistence boundary.
    pub fn from_value(node_type: NodeType, node_id: &str, value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(FlowEngineError::type_mismatch(
                    node_id,
                    "object payload",
                    json_kind(&other),
                ))
            }
        };

        if let Some(key) = node_type.reference_key() {
            let missing = map.get(key).map_or(true, Value::is_null);
            if missing {
                log::debug!(
                    "Node '{}' has no '{}', falling back to the node id",
                    node_id,
                    key
                );
                map.insert(key.to_string(), Value::String(node_id.to_string()));
            }
        }

        let value = Value::Object(map);
        let data = match node_type {
            NodeType::Start => NodeData::Start(serde_json::from_value(value)?),
            NodeType::End => NodeData::End(serde_json::from_value(value)?),
            NodeType::Agent => NodeData::Agent(serde_json::from_value(value)?),
            NodeType::If => NodeData::If(serde_json::from_value(value)?),
            NodeType::DataStore => NodeData::DataStore(serde_json::from_value(value)?),
        };
        Ok(data)
    }

    /// Serialize the payload to its JSON object form
    pub fn to_value(&self) -> Value {
        let result = match self {
            NodeData::Start(d) | NodeData::End(d) => serde_json::to_value(d),
            NodeData::Agent(d) => serde_json::to_value(d),
            NodeData::If(d) => serde_json::to_value(d),
            NodeData::DataStore(d) => serde_json::to_value(d),
        };
        // Plain structs of strings and JSON maps always serialize.
        result.unwrap_or(Value::Null)
    }
}

/// A node instance in a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct FlowNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Position on the canvas
    pub position: Position,
    /// Type-specific payload (also determines the node type)
    pub data: NodeData,
    /// Whether the editor lets the user delete this node
    pub deletable: Option<bool>,
    /// Editor stacking order
    pub z_index: Option<i64>,
}

impl FlowNode {
    /// Create a node from a payload
    pub fn new(id: impl Into<String>, data: NodeData, position: Position) -> Self {
        Self {
            id: id.into(),
            position,
            data,
            deletable: None,
            z_index: None,
        }
    }

    /// Create a Start node
    pub fn start(id: impl Into<String>, position: Position) -> Self {
        let mut node = Self::new(id, NodeData::Start(TerminalNodeData::default()), position);
        node.deletable = Some(false);
        node
    }

    /// Create an End node
    pub fn end(id: impl Into<String>, position: Position) -> Self {
        let mut node = Self::new(id, NodeData::End(TerminalNodeData::default()), position);
        node.deletable = Some(false);
        node
    }

    /// Create an Agent node referencing `agent_id`
    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>, position: Position) -> Self {
        Self::new(
            id,
            NodeData::Agent(AgentNodeData {
                agent_id: agent_id.into(),
                label: None,
                extra: Map::new(),
            }),
            position,
        )
    }

    /// Create an If node referencing `if_node_id`
    pub fn if_node(id: impl Into<String>, if_node_id: impl Into<String>, position: Position) -> Self {
        Self::new(
            id,
            NodeData::If(IfNodeData {
                if_node_id: if_node_id.into(),
                label: None,
                extra: Map::new(),
            }),
            position,
        )
    }

    /// Create a DataStore node referencing `data_store_node_id`
    pub fn data_store(
        id: impl Into<String>,
        data_store_node_id: impl Into<String>,
        position: Position,
    ) -> Self {
        Self::new(
            id,
            NodeData::DataStore(DataStoreNodeData {
                data_store_node_id: data_store_node_id.into(),
                label: None,
                extra: Map::new(),
            }),
            position,
        )
    }

    /// The node's type, derived from its payload
    pub fn node_type(&self) -> NodeType {
        self.data.node_type()
    }

    /// Id of the resource this node references, if any
    pub fn resource_id(&self) -> Option<&str> {
        self.data.resource_id()
    }
}

/// Wire form of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    id: NodeId,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    position: Position,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deletable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    z_index: Option<i64>,
}

impl TryFrom<RawNode> for FlowNode {
    type Error = FlowEngineError;

    fn try_from(raw: RawNode) -> Result<Self> {
        let data = NodeData::from_value(raw.node_type, &raw.id, raw.data)?;
        Ok(Self {
            id: raw.id,
            position: raw.position,
            data,
            deletable: raw.deletable,
            z_index: raw.z_index,
        })
    }
}

impl From<FlowNode> for RawNode {
    fn from(node: FlowNode) -> Self {
        Self {
            node_type: node.node_type(),
            data: node.data.to_value(),
            id: node.id,
            position: node.position,
            deletable: node.deletable,
            z_index: node.z_index,
        }
    }
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    /// Unique identifier for this edge
    pub id: EdgeId,
    /// Source node ID
    pub source: NodeId,
    /// Target node ID
    pub target: NodeId,
    /// Source handle (`"true"`/`"false"` for If sources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Target handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FlowEdge {
    /// Create an edge without handles
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            label: None,
        }
    }

    /// Set the source handle
    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// Check that an id is usable as a node, edge or flow identifier.
///
/// Flow ids double as file names in the persistent store, so path
/// separators and `..` are rejected alongside whitespace and control
/// characters. Returns a description of the problem, or `None` when the id
/// is well formed.
pub fn check_id(id: &str) -> Option<String> {
    if id.is_empty() {
        return Some("id is empty".to_string());
    }
    if id.len() > MAX_ID_LEN {
        return Some(format!("id is longer than {} bytes", MAX_ID_LEN));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Some(format!("id '{}' contains whitespace or control characters", id));
    }
    if id.contains(['/', '\\']) {
        return Some(format!("id '{}' contains a path separator", id));
    }
    if id == "." || id.contains("..") {
        return Some(format!("id '{}' contains a relative path component", id));
    }
    None
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_wire_format() {
        let node = FlowNode::agent("n1", "agent-1", Position::new(10.0, 20.0));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["data"]["agentId"], "agent-1");
        assert_eq!(json["position"]["x"], 10.0);
        assert!(json.get("deletable").is_none());
    }

    #[test]
    fn test_node_deserialize_keeps_editor_keys() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "ds",
            "type": "dataStore",
            "position": {"x": 0.0, "y": 0.0},
            "data": {"dataStoreNodeId": "cfg-1", "color": "teal"},
            "zIndex": 3
        }))
        .unwrap();

        assert_eq!(node.node_type(), NodeType::DataStore);
        assert_eq!(node.resource_id(), Some("cfg-1"));
        assert_eq!(node.z_index, Some(3));
        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["data"]["color"], "teal");
    }

    #[test]
    fn test_legacy_agent_reference_falls_back_to_node_id() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "agent-node",
            "type": "agent",
            "position": {"x": 0.0, "y": 0.0},
            "data": {}
        }))
        .unwrap();
        assert_eq!(node.resource_id(), Some("agent-node"));
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        let result = serde_json::from_value::<FlowNode>(json!({
            "id": "s",
            "type": "start",
            "data": [1, 2]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_if_handles() {
        assert_eq!(NodeType::If.output_handles(), vec!["true", "false"]);
        assert!(NodeType::End.output_handles().is_empty());
    }

    #[test]
    fn test_check_id() {
        assert!(check_id("node-1").is_none());
        assert!(check_id("").is_some());
        assert!(check_id("has space").is_some());
        assert!(check_id(&"x".repeat(200)).is_some());
        assert!(check_id("../escape").is_some());
        assert!(check_id("nested/flow").is_some());
        assert!(check_id("c:\\flows").is_some());
        assert!(check_id("..").is_some());
        assert!(check_id(".").is_some());
        assert!(check_id("v1.2-draft").is_none());
    }
}
