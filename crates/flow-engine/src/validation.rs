//! Validation rules for flows
//!
//! Collects every issue found (not just the first). Field-level rules only
//! apply to nodes on a Start-to-End path; nodes off the path are reported
//! once as disconnected and otherwise left alone.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::datastore::FieldType;
use crate::error::FormulaError;
use crate::flow::Flow;
use crate::formula;
use crate::readiness::ReadyState;
use crate::resources::ResourceStore;
use crate::traversal::{compute_connectivity, ConnectivityMap};
use crate::types::{FlowNode, NodeType, HANDLE_FALSE, HANDLE_TRUE};
use crate::variables::TEXT_FIELD;

/// How serious an issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueSeverity {
    /// Blocks `Ready`
    Error,
    Warning,
}

/// Machine-readable issue kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueCode {
    MalformedId,
    MissingStartNode,
    MultipleStartNodes,
    MissingEndNode,
    MultipleEndNodes,
    DuplicateNodeId,
    DanglingEdge,
    InvalidIfHandle,
    DuplicateIfBranch,
    MissingIfBranch,
    MissingResource,
    UnknownSchemaField,
    MalformedFormula,
    UnknownVariable,
    EmptyPrompt,
    DisconnectedNode,
    EmptyResponseTemplate,
    SchemaFieldInUse,
    InvalidatedFormula,
}

/// One problem found in a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub code: IssueCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ValidationIssue {
    pub fn error(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn warning(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{}] {}", node, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Validate a flow against its resources
pub fn validate_flow(
    flow: &Flow,
    connectivity: &ConnectivityMap,
    resources: &ResourceStore,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    validate_terminals(flow, &mut issues);
    validate_unique_ids(flow, &mut issues);
    validate_edge_references(flow, &mut issues);
    validate_if_branches(flow, connectivity, &mut issues);
    validate_connected_nodes(flow, connectivity, resources, &mut issues);

    if flow.response_template.trim().is_empty() {
        issues.push(ValidationIssue::warning(
            IssueCode::EmptyResponseTemplate,
            "Response template is empty",
        ));
    }

    issues
}

/// Validate `flow`, attach the issues and set its ready state
pub fn run_validation(flow: &mut Flow, resources: &ResourceStore) -> ReadyState {
    let connectivity = compute_connectivity(&flow.nodes, &flow.edges);
    run_validation_with(flow, &connectivity, resources)
}

/// Like [`run_validation`], with connectivity computed by the caller
pub fn run_validation_with(
    flow: &mut Flow,
    connectivity: &ConnectivityMap,
    resources: &ResourceStore,
) -> ReadyState {
    let issues = validate_flow(flow, connectivity, resources);
    let errors = issues.iter().filter(|i| i.is_error()).count();
    let state = if errors == 0 {
        ReadyState::Ready
    } else {
        ReadyState::Error
    };
    log::info!(
        "Validated flow '{}': {} error(s), {} warning(s) -> {}",
        flow.id,
        errors,
        issues.len() - errors,
        state
    );
    flow.set_ready_state(state, issues);
    state
}

/// Exactly one Start and one End
fn validate_terminals(flow: &Flow, issues: &mut Vec<ValidationIssue>) {
    let count = |t: NodeType| flow.nodes.iter().filter(|n| n.node_type() == t).count();

    match count(NodeType::Start) {
        0 => issues.push(ValidationIssue::error(IssueCode::MissingStartNode, "Flow has no Start node")),
        1 => {}
        n => issues.push(ValidationIssue::error(
            IssueCode::MultipleStartNodes,
            format!("Flow has {} Start nodes", n),
        )),
    }
    match count(NodeType::End) {
        0 => issues.push(ValidationIssue::error(IssueCode::MissingEndNode, "Flow has no End node")),
        1 => {}
        n => issues.push(ValidationIssue::error(
            IssueCode::MultipleEndNodes,
            format!("Flow has {} End nodes", n),
        )),
    }
}

fn validate_unique_ids(flow: &Flow, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for node in &flow.nodes {
        if !seen.insert(node.id.as_str()) && reported.insert(node.id.as_str()) {
            issues.push(
                ValidationIssue::error(
                    IssueCode::DuplicateNodeId,
                    format!("Node id '{}' is used more than once", node.id),
                )
                .with_node(&node.id),
            );
        }
    }
}

/// Check that all edge source/target nodes exist
fn validate_edge_references(flow: &Flow, issues: &mut Vec<ValidationIssue>) {
    let node_ids: HashSet<&str> = flow.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &flow.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !node_ids.contains(endpoint.as_str()) {
                issues.push(ValidationIssue::error(
                    IssueCode::DanglingEdge,
                    format!("Edge '{}' references unknown node '{}'", edge.id, endpoint),
                ));
            }
        }
    }
}

/// If nodes branch on `"true"`/`"false"` handles, one edge each
fn validate_if_branches(
    flow: &Flow,
    connectivity: &ConnectivityMap,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut handles: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in flow.nodes.iter().filter(|n| n.node_type() == NodeType::If) {
        handles.entry(&node.id).or_default();
    }

    for edge in &flow.edges {
        let Some(taken) = handles.get_mut(edge.source.as_str()) else {
            continue;
        };
        match edge.source_handle.as_deref() {
            Some(h @ (HANDLE_TRUE | HANDLE_FALSE)) => {
                if taken.contains(&h) {
                    issues.push(
                        ValidationIssue::error(
                            IssueCode::DuplicateIfBranch,
                            format!("If node has more than one '{}' edge", h),
                        )
                        .with_node(&edge.source),
                    );
                } else {
                    taken.push(h);
                }
            }
            other => issues.push(
                ValidationIssue::error(
                    IssueCode::InvalidIfHandle,
                    format!(
                        "Edge '{}' leaves an If node through handle {:?}; expected \"true\" or \"false\"",
                        edge.id, other
                    ),
                )
                .with_node(&edge.source),
            ),
        }
    }

    for node in flow.nodes.iter().filter(|n| n.node_type() == NodeType::If) {
        if !connectivity.requires_field_validation(&node.id) {
            continue;
        }
        let taken = handles.get(node.id.as_str()).map(Vec::as_slice).unwrap_or_default();
        for handle in [HANDLE_TRUE, HANDLE_FALSE] {
            if !taken.contains(&handle) {
                issues.push(
                    ValidationIssue::error(
                        IssueCode::MissingIfBranch,
                        format!("If node has no '{}' branch", handle),
                    )
                    .with_node(&node.id),
                );
            }
        }
    }
}

/// Resource and field rules for nodes on a Start-to-End path
fn validate_connected_nodes(
    flow: &Flow,
    connectivity: &ConnectivityMap,
    resources: &ResourceStore,
    issues: &mut Vec<ValidationIssue>,
) {
    let known_variables = known_variables(flow, resources);
    let mut checked = HashSet::new();

    for node in &flow.nodes {
        if !checked.insert(node.id.as_str()) {
            continue;
        }
        if !connectivity.requires_field_validation(&node.id) {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::DisconnectedNode,
                    format!("{} node is not on a path from Start to End", node.node_type()),
                )
                .with_node(&node.id),
            );
            continue;
        }
        if !resources.resolves(node) {
            issues.push(
                ValidationIssue::error(
                    IssueCode::MissingResource,
                    format!(
                        "{} node references missing resource '{}'",
                        node.node_type(),
                        node.resource_id().unwrap_or_default()
                    ),
                )
                .with_node(&node.id),
            );
            continue;
        }
        match node.node_type() {
            NodeType::Agent => validate_agent(node, resources, issues),
            NodeType::DataStore => validate_data_store(flow, node, resources, &known_variables, issues),
            NodeType::Start | NodeType::End | NodeType::If => {}
        }
    }
}

fn validate_agent(node: &FlowNode, resources: &ResourceStore, issues: &mut Vec<ValidationIssue>) {
    let Some(Ok(agent)) = node.resource_id().map(|id| resources.agent(id)) else {
        return;
    };
    if agent.prompt_messages.is_empty() {
        issues.push(
            ValidationIssue::error(
                IssueCode::EmptyPrompt,
                format!("Agent '{}' has no prompt messages", agent.name),
            )
            .with_node(&node.id),
        );
    }
}

fn validate_data_store(
    flow: &Flow,
    node: &FlowNode,
    resources: &ResourceStore,
    known_variables: &HashSet<String>,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(Ok(config)) = node.resource_id().map(|id| resources.data_store_node(id)) else {
        return;
    };

    for field in &config.data_store_fields {
        let schema_field = flow
            .data_store_schema
            .as_ref()
            .and_then(|s| s.find_field(&field.schema_field_id));
        let Some(schema_field) = schema_field else {
            issues.push(
                ValidationIssue::error(
                    IssueCode::UnknownSchemaField,
                    format!(
                        "Field '{}' references unknown schema field '{}'",
                        field.id, field.schema_field_id
                    ),
                )
                .with_node(&node.id),
            );
            continue;
        };

        let Some(logic) = field.logic.as_deref().filter(|l| !l.trim().is_empty()) else {
            continue;
        };
        match formula::parse(logic) {
            Err(FormulaError::Malformed { .. }) if schema_field.field_type == FieldType::String => {}
            Err(e) => issues.push(
                ValidationIssue::error(
                    IssueCode::MalformedFormula,
                    format!("Logic for '{}' is invalid: {}", schema_field.name, e),
                )
                .with_node(&node.id),
            ),
            Ok(_) => {}
        }
        for name in formula::referenced_variables(logic) {
            if !known_variables.contains(&name) {
                issues.push(
                    ValidationIssue::warning(
                        IssueCode::UnknownVariable,
                        format!(
                            "Logic for '{}' reads '{}', which is neither a data-store field nor an agent output",
                            schema_field.name, name
                        ),
                    )
                    .with_node(&node.id),
                );
            }
        }
    }
}

/// Data-store field names, `namespace.field` keys of the flow's agents and
/// their `namespace.text` replies.
/// System variables are supplied at turn time and cannot be checked here.
fn known_variables(flow: &Flow, resources: &ResourceStore) -> HashSet<String> {
    let mut known: HashSet<String> = flow
        .data_store_schema
        .iter()
        .flat_map(|s| s.fields.iter().map(|f| f.name.clone()))
        .collect();

    for node in flow.nodes.iter().filter(|n| n.node_type() == NodeType::Agent) {
        let Some(Ok(agent)) = node.resource_id().map(|id| resources.agent(id)) else {
            continue;
        };
        let namespace = agent.namespace();
        known.insert(format!("{}.{}", namespace, TEXT_FIELD));
        if !agent.enable_structured_output {
            continue;
        }
        known.extend(
            agent
                .schema_fields
                .iter()
                .map(|f| format!("{}.{}", namespace, f.name)),
        );
    }
    known
}
