//! The persisted flow document
//!
//! A flow can always be constructed; whether it is usable is decided later
//! by traversal and validation. Construction only rejects ids a caller could
//! have checked themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::datastore::DataStoreSchema;
use crate::error::{EntityKind, FlowEngineError, Result};
use crate::readiness::{next_ready_state, ReadyState};
use crate::types::{check_id, FlowEdge, FlowNode, NodeType};
use crate::validation::{IssueCode, ValidationIssue};

/// An agent pipeline graph and its flow-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_schema: Option<DataStoreSchema>,
    #[serde(default)]
    pub response_template: String,
    #[serde(default)]
    pub ready_state: ReadyState,
    #[serde(default)]
    pub validation_issues: Vec<ValidationIssue>,
    /// Editor panel layout, stored as given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_structure: Option<Value>,
    /// Editor viewport, stored as given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibe_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Initial contents for [`Flow::create`]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowProps {
    /// Generated when absent
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub data_store_schema: Option<DataStoreSchema>,
    pub response_template: String,
}

/// Partial update of a flow. Absent fields are left untouched.
///
/// Nullable fields use a nested option: `Some(None)` clears the field,
/// `None` leaves it as is.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub nodes: Option<Vec<FlowNode>>,
    pub edges: Option<Vec<FlowEdge>>,
    #[serde(deserialize_with = "present")]
    pub data_store_schema: Option<Option<DataStoreSchema>>,
    pub response_template: Option<String>,
    pub ready_state: Option<ReadyState>,
    pub validation_issues: Option<Vec<ValidationIssue>>,
    #[serde(deserialize_with = "present")]
    pub panel_structure: Option<Option<Value>>,
    #[serde(deserialize_with = "present")]
    pub viewport: Option<Option<Value>>,
    #[serde(deserialize_with = "present")]
    pub vibe_session_id: Option<Option<String>>,
}

impl FlowUpdate {
    /// Whether the update replaces nodes, edges or the response template
    pub fn is_structural(&self) -> bool {
        self.nodes.is_some() || self.edges.is_some() || self.response_template.is_some()
    }
}

/// A key that is present deserializes to `Some`, even when its value is null
fn present<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl Flow {
    /// Create a flow in the `Draft` state
    pub fn create(props: FlowProps) -> Result<Self> {
        let id = props
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut issues = Vec::new();
        if let Some(problem) = check_id(&id) {
            issues.push(ValidationIssue::error(
                IssueCode::MalformedId,
                format!("Flow {}", problem),
            ));
        }
        check_graph_ids(&props.nodes, &props.edges, &mut issues);
        if !issues.is_empty() {
            return Err(FlowEngineError::ValidationFailure(issues));
        }

        let now = Utc::now();
        log::debug!("Creating flow '{}' ({})", props.name, id);
        Ok(Self {
            id,
            name: props.name,
            description: props.description,
            nodes: props.nodes,
            edges: props.edges,
            data_store_schema: props.data_store_schema,
            response_template: props.response_template,
            ready_state: ReadyState::Draft,
            validation_issues: Vec::new(),
            panel_structure: None,
            viewport: None,
            vibe_session_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply the fields present in `update`.
    ///
    /// On error the flow is left unchanged.
    pub fn update(&mut self, update: FlowUpdate) -> Result<()> {
        let mut issues = Vec::new();
        check_graph_ids(
            update.nodes.as_deref().unwrap_or_default(),
            update.edges.as_deref().unwrap_or_default(),
            &mut issues,
        );
        if !issues.is_empty() {
            return Err(FlowEngineError::ValidationFailure(issues));
        }

        let next_state = next_ready_state(self.ready_state, &update);
        if next_state != self.ready_state {
            log::debug!(
                "Flow '{}' ready state {} -> {}",
                self.id,
                self.ready_state,
                next_state
            );
        }

        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(nodes) = update.nodes {
            self.nodes = nodes;
        }
        if let Some(edges) = update.edges {
            self.edges = edges;
        }
        if let Some(schema) = update.data_store_schema {
            self.data_store_schema = schema;
        }
        if let Some(template) = update.response_template {
            self.response_template = template;
        }
        if let Some(issues) = update.validation_issues {
            self.validation_issues = issues;
        }
        if let Some(panel) = update.panel_structure {
            self.panel_structure = panel;
        }
        if let Some(viewport) = update.viewport {
            self.viewport = viewport;
        }
        if let Some(session) = update.vibe_session_id {
            self.vibe_session_id = session;
        }

        self.ready_state = next_state;
        self.touch();
        Ok(())
    }

    /// Record the result of a validation pass
    pub fn set_ready_state(&mut self, state: ReadyState, issues: Vec<ValidationIssue>) {
        self.ready_state = state;
        self.validation_issues = issues;
        self.touch();
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn find_node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_mut(&mut self, id: &str) -> Option<&mut FlowNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Find a node or fail with `NotFound`
    pub fn require_node(&self, id: &str) -> Result<&FlowNode> {
        self.find_node(id)
            .ok_or_else(|| FlowEngineError::not_found(EntityKind::Node, id))
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.node_type() == NodeType::Start)
    }

    pub fn end_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.node_type() == NodeType::End)
    }

    pub fn outgoing_edges<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a FlowEdge> + 'b
    where
        'a: 'b,
    {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    pub fn incoming_edges<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a FlowEdge> + 'b
    where
        'a: 'b,
    {
        self.edges.iter().filter(move |e| e.target == node_id)
    }
}

fn check_graph_ids(nodes: &[FlowNode], edges: &[FlowEdge], issues: &mut Vec<ValidationIssue>) {
    for node in nodes {
        if let Some(problem) = check_id(&node.id) {
            issues.push(ValidationIssue::error(
                IssueCode::MalformedId,
                format!("Node {}", problem),
            ));
        }
    }
    for edge in edges {
        if let Some(problem) = check_id(&edge.id) {
            issues.push(ValidationIssue::error(
                IssueCode::MalformedId,
                format!("Edge {}", problem),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Position;
    use serde_json::json;

    fn props() -> FlowProps {
        let p = Position::default();
        FlowProps {
            name: "Story".into(),
            nodes: vec![FlowNode::start("start", p), FlowNode::end("end", p)],
            edges: vec![FlowEdge::new("e1", "start", "end")],
            ..Default::default()
        }
    }

    #[test]
    fn test_create_defaults() {
        let flow = Flow::create(props()).unwrap();
        assert_eq!(flow.ready_state, ReadyState::Draft);
        assert!(!flow.id.is_empty());
        assert!(flow.validation_issues.is_empty());
        assert_eq!(flow.created_at, flow.updated_at);
    }

    #[test]
    fn test_create_rejects_malformed_ids() {
        let mut props = props();
        props.id = Some("has space".into());
        props.edges.push(FlowEdge::new("", "start", "end"));
        match Flow::create(props) {
            Err(FlowEngineError::ValidationFailure(issues)) => assert_eq!(issues.len(), 2),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_create_tolerates_dangling_edges() {
        let mut props = props();
        props.edges.push(FlowEdge::new("e2", "start", "ghost"));
        assert!(Flow::create(props).is_ok());
    }

    #[test]
    fn test_update_by_presence() {
        let mut flow = Flow::create(props()).unwrap();
        flow.description = "keep me".into();
        flow.viewport = Some(json!({"x": 0, "y": 0, "zoom": 1}));
        flow.ready_state = ReadyState::Ready;

        let update: FlowUpdate = serde_json::from_value(json!({
            "name": "Renamed",
            "viewport": null
        }))
        .unwrap();
        flow.update(update).unwrap();

        assert_eq!(flow.name, "Renamed");
        assert_eq!(flow.description, "keep me");
        assert_eq!(flow.viewport, None);
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.ready_state, ReadyState::Ready);
    }

    #[test]
    fn test_structural_update_returns_to_draft() {
        let mut flow = Flow::create(props()).unwrap();
        flow.ready_state = ReadyState::Ready;
        flow.update(FlowUpdate {
            edges: Some(Vec::new()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(flow.ready_state, ReadyState::Draft);
        assert!(flow.edges.is_empty());
    }

    #[test]
    fn test_failed_update_leaves_flow_untouched() {
        let mut flow = Flow::create(props()).unwrap();
        let before = flow.clone();
        let result = flow.update(FlowUpdate {
            name: Some("New".into()),
            nodes: Some(vec![FlowNode::start("bad id", Position::default())]),
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(flow, before);
    }

    #[test]
    fn test_round_trip() {
        let mut flow = Flow::create(props()).unwrap();
        flow.nodes.push(FlowNode::agent("narrator", "agent-1", Position::new(100.0, 0.0)));
        flow.panel_structure = Some(json!({"left": ["vars"]}));

        let json = serde_json::to_string(&flow).unwrap();
        let restored: Flow = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, flow);

        let doc: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["readyState"], "draft");
        assert!(doc.get("responseTemplate").is_some());
        assert_eq!(doc["nodes"][0]["deletable"], false);
    }

    #[test]
    fn test_edges_by_direction() {
        let flow = Flow::create(props()).unwrap();
        assert_eq!(flow.outgoing_edges("start").count(), 1);
        assert_eq!(flow.incoming_edges("start").count(), 0);
        assert!(matches!(
            flow.require_node("ghost"),
            Err(FlowEngineError::NotFound { kind: EntityKind::Node, .. })
        ));
        assert_eq!(flow.start_node().map(|n| n.id.as_str()), Some("start"));
    }
}
