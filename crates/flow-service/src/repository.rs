//! Persistence seams
//!
//! The service talks to storage only through these traits so hosts can back
//! them with a database, a remote API or the local file store. Every write is
//! a read-current, merge, write-back cycle with no cross-call locking.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use flow_engine::{
    Agent, DataStoreNode, Flow, FlowEdge, FlowNode, FlowStore, FlowSummary, IfNode, ResourceStore,
};

use crate::error::Result;

/// Storage for flow documents
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn get_flow_by_id(&self, id: &str) -> Result<Flow>;

    async fn save_flow(&self, flow: Flow) -> Result<()>;

    /// Shallow-merge `patch` into one node's data and persist only that change
    async fn update_node(&self, flow_id: &str, node_id: &str, patch: &Value) -> Result<FlowNode>;

    /// Replace nodes and edges, keeping stored data for retained nodes
    async fn update_nodes_and_edges(
        &self,
        flow_id: &str,
        nodes: Vec<FlowNode>,
        edges: Vec<FlowEdge>,
    ) -> Result<Flow>;

    async fn update_flow_viewport(&self, flow_id: &str, viewport: Option<Value>) -> Result<()>;

    async fn list_flows(&self) -> Result<Vec<FlowSummary>>;
}

/// Storage for the resources flow nodes reference
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn get_agent(&self, id: &str) -> Result<Agent>;

    async fn save_agent(&self, agent: Agent) -> Result<()>;

    async fn get_if_node(&self, id: &str) -> Result<IfNode>;

    async fn save_if_node(&self, if_node: IfNode) -> Result<()>;

    async fn get_data_store_node(&self, id: &str) -> Result<DataStoreNode>;

    async fn save_data_store_node(&self, node: DataStoreNode) -> Result<()>;

    /// Every resource, for validation and turn execution
    async fn snapshot(&self) -> Result<ResourceStore>;
}

/// Source of the system partition of the variable registry
#[async_trait]
pub trait SystemVariableProvider: Send + Sync {
    async fn system_variables(&self, flow_id: &str) -> Result<BTreeMap<String, Value>>;
}

/// [`FlowRepository`] over the engine's local [`FlowStore`]
#[derive(Debug, Default)]
pub struct LocalFlowRepository {
    store: Mutex<FlowStore>,
}

impl LocalFlowRepository {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist flows as JSON files under `dir`, loading any already there
    pub fn with_persistence(dir: impl AsRef<Path>) -> Result<Self> {
        let mut store = FlowStore::with_persistence(dir);
        let count = store.load_from_disk()?;
        log::info!("Loaded {} flow(s) from disk", count);
        Ok(Self {
            store: Mutex::new(store),
        })
    }
}

#[async_trait]
impl FlowRepository for LocalFlowRepository {
    async fn get_flow_by_id(&self, id: &str) -> Result<Flow> {
        Ok(self.store.lock().get_flow_by_id(id)?.clone())
    }

    async fn save_flow(&self, flow: Flow) -> Result<()> {
        Ok(self.store.lock().save_flow(flow)?)
    }

    async fn update_node(&self, flow_id: &str, node_id: &str, patch: &Value) -> Result<FlowNode> {
        Ok(self.store.lock().update_node(flow_id, node_id, patch)?)
    }

    async fn update_nodes_and_edges(
        &self,
        flow_id: &str,
        nodes: Vec<FlowNode>,
        edges: Vec<FlowEdge>,
    ) -> Result<Flow> {
        let mut store = self.store.lock();
        Ok(store.update_nodes_and_edges(flow_id, nodes, edges)?.clone())
    }

    async fn update_flow_viewport(&self, flow_id: &str, viewport: Option<Value>) -> Result<()> {
        Ok(self.store.lock().update_flow_viewport(flow_id, viewport)?)
    }

    async fn list_flows(&self) -> Result<Vec<FlowSummary>> {
        Ok(self.store.lock().list_flows())
    }
}

/// [`ResourceRepository`] held in memory
#[derive(Debug, Default)]
pub struct InMemoryResourceRepository {
    store: Mutex<ResourceStore>,
}

impl InMemoryResourceRepository {
    pub fn new(store: ResourceStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }
}

#[async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn get_agent(&self, id: &str) -> Result<Agent> {
        Ok(self.store.lock().agent(id)?.clone())
    }

    async fn save_agent(&self, agent: Agent) -> Result<()> {
        self.store.lock().insert_agent(agent);
        Ok(())
    }

    async fn get_if_node(&self, id: &str) -> Result<IfNode> {
        Ok(self.store.lock().if_node(id)?.clone())
    }

    async fn save_if_node(&self, if_node: IfNode) -> Result<()> {
        self.store.lock().insert_if_node(if_node);
        Ok(())
    }

    async fn get_data_store_node(&self, id: &str) -> Result<DataStoreNode> {
        Ok(self.store.lock().data_store_node(id)?.clone())
    }

    async fn save_data_store_node(&self, node: DataStoreNode) -> Result<()> {
        self.store.lock().insert_data_store_node(node);
        Ok(())
    }

    async fn snapshot(&self) -> Result<ResourceStore> {
        Ok(self.store.lock().clone())
    }
}

/// Fixed system variables, the same for every flow
#[derive(Debug, Clone, Default)]
pub struct StaticSystemVariables(pub BTreeMap<String, Value>);

#[async_trait]
impl SystemVariableProvider for StaticSystemVariables {
    async fn system_variables(&self, _flow_id: &str) -> Result<BTreeMap<String, Value>> {
        Ok(self.0.clone())
    }
}
