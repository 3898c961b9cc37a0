//! Resources referenced by flow nodes
//!
//! Agent, If and DataStore nodes hold only the id of a separately owned
//! configuration. The [`ResourceStore`] is the collection that owns them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::batch::BatchOutcome;
use crate::condition::IfNode;
use crate::datastore::{remove_schema_field, DataStoreNode, DataStoreSchema, SchemaFieldRemoval};
use crate::error::{EntityKind, FlowEngineError, Result};
use crate::flow::Flow;
use crate::types::{FlowNode, NodeType};

/// Agents, if-node configurations and data-store node configurations keyed by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStore {
    #[serde(default)]
    pub agents: BTreeMap<String, Agent>,
    #[serde(default)]
    pub if_nodes: BTreeMap<String, IfNode>,
    #[serde(default)]
    pub data_store_nodes: BTreeMap<String, DataStoreNode>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent(&mut self, agent: Agent) -> Option<Agent> {
        self.agents.insert(agent.id.clone(), agent)
    }

    pub fn insert_if_node(&mut self, if_node: IfNode) -> Option<IfNode> {
        self.if_nodes.insert(if_node.id.clone(), if_node)
    }

    pub fn insert_data_store_node(&mut self, node: DataStoreNode) -> Option<DataStoreNode> {
        self.data_store_nodes.insert(node.id.clone(), node)
    }

    pub fn agent(&self, id: &str) -> Result<&Agent> {
        self.agents
            .get(id)
            .ok_or_else(|| FlowEngineError::not_found(EntityKind::Agent, id))
    }

    pub fn agent_mut(&mut self, id: &str) -> Result<&mut Agent> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| FlowEngineError::not_found(EntityKind::Agent, id))
    }

    pub fn if_node(&self, id: &str) -> Result<&IfNode> {
        self.if_nodes
            .get(id)
            .ok_or_else(|| FlowEngineError::not_found(EntityKind::IfNode, id))
    }

    pub fn data_store_node(&self, id: &str) -> Result<&DataStoreNode> {
        self.data_store_nodes
            .get(id)
            .ok_or_else(|| FlowEngineError::not_found(EntityKind::DataStoreNode, id))
    }

    pub fn data_store_node_mut(&mut self, id: &str) -> Result<&mut DataStoreNode> {
        self.data_store_nodes
            .get_mut(id)
            .ok_or_else(|| FlowEngineError::not_found(EntityKind::DataStoreNode, id))
    }

    /// Whether the resource a node points at exists. Start/End always pass.
    pub fn resolves(&self, node: &FlowNode) -> bool {
        let Some(id) = node.resource_id() else {
            return true;
        };
        match node.node_type() {
            NodeType::Agent => self.agents.contains_key(id),
            NodeType::If => self.if_nodes.contains_key(id),
            NodeType::DataStore => self.data_store_nodes.contains_key(id),
            NodeType::Start | NodeType::End => true,
        }
    }

    /// Agent referenced by an Agent node of `flow`
    pub fn agent_for_node(&self, flow: &Flow, node_id: &str) -> Result<&Agent> {
        let id = reference(flow, node_id, NodeType::Agent)?;
        self.agent(id)
    }

    /// If-node configuration referenced by an If node of `flow`
    pub fn if_node_for_node(&self, flow: &Flow, node_id: &str) -> Result<&IfNode> {
        let id = reference(flow, node_id, NodeType::If)?;
        self.if_node(id)
    }

    /// Data-store configuration referenced by a DataStore node of `flow`
    pub fn data_store_node_for_node(&self, flow: &Flow, node_id: &str) -> Result<&DataStoreNode> {
        let id = reference(flow, node_id, NodeType::DataStore)?;
        self.data_store_node(id)
    }

    /// Set the logic of one data-store field on the configuration behind a
    /// DataStore node. Creates the field when the node has none for that
    /// schema field.
    pub fn set_data_store_logic(
        &mut self,
        flow: &Flow,
        node_id: &str,
        schema_field_id: &str,
        logic: Option<&str>,
    ) -> Result<()> {
        let schema = flow.data_store_schema.as_ref().ok_or_else(|| {
            FlowEngineError::not_found(EntityKind::SchemaField, schema_field_id)
        })?;
        if schema.find_field(schema_field_id).is_none() {
            return Err(FlowEngineError::not_found(EntityKind::SchemaField, schema_field_id));
        }

        let id = reference(flow, node_id, NodeType::DataStore)?.to_string();
        let node = self.data_store_node_mut(&id)?;
        match node
            .data_store_fields
            .iter_mut()
            .find(|f| f.schema_field_id == schema_field_id)
        {
            Some(field) => field.logic = logic.map(str::to_string),
            None => {
                let field_id = uuid::Uuid::new_v4().to_string();
                node.data_store_fields.push(crate::datastore::DataStoreField::new(
                    field_id,
                    schema_field_id,
                    logic,
                ));
            }
        }
        Ok(())
    }

    /// Delete a schema field from `schema`, applying the reference rule to
    /// every data-store configuration held here
    pub fn remove_schema_field(
        &mut self,
        schema: &mut DataStoreSchema,
        schema_field_id: &str,
        cascade: bool,
    ) -> Result<SchemaFieldRemoval> {
        let mut nodes: Vec<DataStoreNode> = std::mem::take(&mut self.data_store_nodes)
            .into_values()
            .collect();
        let result = remove_schema_field(schema, &mut nodes, schema_field_id, cascade);
        self.data_store_nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        result
    }

    /// Duplicate agents under fresh ids. Each id is handled independently.
    pub fn clone_agents(&mut self, ids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        for (index, id) in ids.iter().enumerate() {
            match self.agent(id) {
                Ok(agent) => {
                    let mut copy = agent.clone();
                    copy.id = uuid::Uuid::new_v4().to_string();
                    copy.name = format!("{} (copy)", agent.name);
                    let new_id = copy.id.clone();
                    self.insert_agent(copy);
                    outcome.success(index, new_id);
                }
                Err(e) => outcome.failure(index, Some(id.clone()), &e),
            }
        }
        log::info!(
            "Cloned {} agent(s), {} failed",
            outcome.succeeded,
            outcome.failed
        );
        outcome
    }
}

fn reference<'a>(flow: &'a Flow, node_id: &str, expected: NodeType) -> Result<&'a str> {
    let node = flow.require_node(node_id)?;
    if node.node_type() != expected {
        return Err(FlowEngineError::type_mismatch(
            node_id,
            expected.label(),
            node.node_type().label(),
        ));
    }
    node.resource_id()
        .ok_or_else(|| FlowEngineError::incomplete(format!("node '{}' has no resource reference", node_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchStatus;
    use crate::datastore::{DataStoreSchemaField, FieldType};
    use crate::flow::FlowProps;
    use crate::types::Position;
    use serde_json::json;

    fn flow() -> Flow {
        let p = Position::default();
        let mut flow = Flow::create(FlowProps {
            name: "Story".into(),
            nodes: vec![
                FlowNode::start("start", p),
                FlowNode::agent("narrator", "agent-1", p),
                FlowNode::data_store("stats", "ds-1", p),
                FlowNode::end("end", p),
            ],
            ..Default::default()
        })
        .unwrap();
        flow.data_store_schema = Some(DataStoreSchema::new(vec![DataStoreSchemaField::new(
            "f-health",
            "health",
            FieldType::Integer,
            json!(50),
        )]));
        flow
    }

    #[test]
    fn test_data_store_logic_requires_data_store_node() {
        let flow = flow();
        let mut store = ResourceStore::new();
        store.insert_data_store_node(DataStoreNode::new("ds-1", "Stats"));

        let err = store
            .set_data_store_logic(&flow, "narrator", "f-health", Some("1"))
            .unwrap_err();
        assert!(matches!(err, FlowEngineError::TypeMismatch { .. }));

        store
            .set_data_store_logic(&flow, "stats", "f-health", Some("{{health}}+1"))
            .unwrap();
        store
            .set_data_store_logic(&flow, "stats", "f-health", Some("{{health}}+2"))
            .unwrap();
        let node = store.data_store_node("ds-1").unwrap();
        assert_eq!(node.data_store_fields.len(), 1);
        assert_eq!(node.data_store_fields[0].logic.as_deref(), Some("{{health}}+2"));
    }

    #[test]
    fn test_unknown_schema_field_is_not_found() {
        let flow = flow();
        let mut store = ResourceStore::new();
        store.insert_data_store_node(DataStoreNode::new("ds-1", "Stats"));
        let err = store
            .set_data_store_logic(&flow, "stats", "f-missing", None)
            .unwrap_err();
        assert!(matches!(err, FlowEngineError::NotFound { kind: EntityKind::SchemaField, .. }));
    }

    #[test]
    fn test_clone_agents_reports_partial_failure() {
        let mut store = ResourceStore::new();
        store.insert_agent(Agent::new("agent-1", "Narrator"));

        let outcome = store.clone_agents(&["agent-1".to_string(), "ghost".to_string()]);
        assert_eq!(outcome.status(), BatchStatus::PartialFailure);
        assert_eq!(store.agents.len(), 2);
        let new_id = outcome.items[0].id.clone().unwrap();
        assert_eq!(store.agent(&new_id).unwrap().name, "Narrator (copy)");
    }

    #[test]
    fn test_resolves() {
        let flow = flow();
        let mut store = ResourceStore::new();
        store.insert_agent(Agent::new("agent-1", "Narrator"));
        assert!(store.resolves(flow.find_node("narrator").unwrap()));
        assert!(!store.resolves(flow.find_node("stats").unwrap()));
        assert!(store.resolves(flow.find_node("start").unwrap()));
        assert!(store.agent_for_node(&flow, "narrator").is_ok());
    }
}
