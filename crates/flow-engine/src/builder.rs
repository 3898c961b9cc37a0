//! Fluent builder for flow graphs
//!
//! Provides a compact API for constructing flows programmatically, mostly
//! for hosts seeding templates and for tests.

use chrono::Utc;

use crate::datastore::DataStoreSchema;
use crate::flow::Flow;
use crate::readiness::ReadyState;
use crate::types::{FlowEdge, FlowNode, Position, HANDLE_FALSE, HANDLE_TRUE};

/// Horizontal spacing between auto-placed nodes
const COLUMN_WIDTH: f64 = 250.0;

/// Fluent builder for constructing flows
///
/// # Example
///
/// ```ignore
/// let flow = FlowBuilder::new("flow-1", "Story")
///     .start("start")
///     .agent("narrator", "agent-1")
///     .if_node("alive", "if-1")
///     .end("end")
///     .connect("start", "narrator")
///     .connect("narrator", "alive")
///     .branch("alive", true, "narrator")
///     .branch("alive", false, "end")
///     .build();
/// ```
pub struct FlowBuilder {
    id: String,
    name: String,
    description: String,
    nodes: Vec<FlowNode>,
    edges: Vec<FlowEdge>,
    data_store_schema: Option<DataStoreSchema>,
    response_template: String,
    edge_counter: usize,
}

impl FlowBuilder {
    /// Create a new flow builder
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            data_store_schema: None,
            response_template: String::new(),
            edge_counter: 0,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn next_position(&self) -> Position {
        Position::new(self.nodes.len() as f64 * COLUMN_WIDTH, 0.0)
    }

    /// Add an already constructed node
    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn start(self, id: impl Into<String>) -> Self {
        let position = self.next_position();
        self.node(FlowNode::start(id, position))
    }

    pub fn end(self, id: impl Into<String>) -> Self {
        let position = self.next_position();
        self.node(FlowNode::end(id, position))
    }

    /// Add an Agent node referencing `agent_id`
    pub fn agent(self, id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let position = self.next_position();
        self.node(FlowNode::agent(id, agent_id, position))
    }

    /// Add an If node referencing `if_node_id`
    pub fn if_node(self, id: impl Into<String>, if_node_id: impl Into<String>) -> Self {
        let position = self.next_position();
        self.node(FlowNode::if_node(id, if_node_id, position))
    }

    /// Add a DataStore node referencing `data_store_node_id`
    pub fn data_store(self, id: impl Into<String>, data_store_node_id: impl Into<String>) -> Self {
        let position = self.next_position();
        self.node(FlowNode::data_store(id, data_store_node_id, position))
    }

    fn push_edge(mut self, source: String, target: String, handle: Option<&str>) -> Self {
        self.edge_counter += 1;
        let mut edge = FlowEdge::new(format!("edge-{}", self.edge_counter), source, target);
        if let Some(handle) = handle {
            edge = edge.with_source_handle(handle);
        }
        self.edges.push(edge);
        self
    }

    /// Add an edge between two nodes (auto-generates edge ID)
    pub fn connect(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_edge(source.into(), target.into(), None)
    }

    /// Add the `true` or `false` branch of an If node
    pub fn branch(self, source: impl Into<String>, when: bool, target: impl Into<String>) -> Self {
        let handle = if when { HANDLE_TRUE } else { HANDLE_FALSE };
        self.push_edge(source.into(), target.into(), Some(handle))
    }

    pub fn schema(mut self, schema: DataStoreSchema) -> Self {
        self.data_store_schema = Some(schema);
        self
    }

    pub fn response_template(mut self, template: impl Into<String>) -> Self {
        self.response_template = template.into();
        self
    }

    /// Build the flow in the `Draft` state.
    ///
    /// Nothing is checked here; run validation on the result.
    pub fn build(self) -> Flow {
        let now = Utc::now();
        Flow {
            id: self.id,
            name: self.name,
            description: self.description,
            nodes: self.nodes,
            edges: self.edges,
            data_store_schema: self.data_store_schema,
            response_template: self.response_template,
            ready_state: ReadyState::Draft,
            validation_issues: Vec::new(),
            panel_structure: None,
            viewport: None,
            vibe_session_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
