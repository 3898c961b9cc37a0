//! Flow application service
//!
//! Ties the repositories to the engine. The service instance owns the
//! traversal cache, so two services never share memoized connectivity.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use flow_engine::transfer::{export_flow, import_flow};
use flow_engine::validation::run_validation_with;
use flow_engine::{
    select_branch, ConnectivityMap, Flow, FlowBundle, FlowEdge, FlowNode, ModelOverride,
    ReadyState, TraversalCache,
};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::repository::{FlowRepository, ResourceRepository, SystemVariableProvider};
use crate::turn::{run_turn, AgentRunner, CancelSignal, TurnInput, TurnOutcome};

/// Host-agnostic facade over flow storage, validation and turn execution
pub struct FlowService {
    flows: Arc<dyn FlowRepository>,
    resources: Arc<dyn ResourceRepository>,
    system: Arc<dyn SystemVariableProvider>,
    cache: TraversalCache,
    config: ServiceConfig,
}

impl FlowService {
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        resources: Arc<dyn ResourceRepository>,
        system: Arc<dyn SystemVariableProvider>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            flows,
            resources,
            system,
            cache: TraversalCache::new(),
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &TraversalCache {
        &self.cache
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<Flow> {
        self.flows.get_flow_by_id(flow_id).await
    }

    /// Connectivity of a stored flow, memoized by structural fingerprint
    pub async fn connectivity(&self, flow_id: &str) -> Result<Arc<ConnectivityMap>> {
        let flow = self.flows.get_flow_by_id(flow_id).await?;
        Ok(self.connectivity_of(&flow))
    }

    fn connectivity_of(&self, flow: &Flow) -> Arc<ConnectivityMap> {
        if self.config.cache_traversal {
            self.cache.get_or_compute(&flow.id, &flow.nodes, &flow.edges)
        } else {
            Arc::new(flow_engine::compute_connectivity(&flow.nodes, &flow.edges))
        }
    }

    /// Run the validation rules, store the outcome and return the new state
    pub async fn validate(&self, flow_id: &str) -> Result<ReadyState> {
        let mut flow = self.flows.get_flow_by_id(flow_id).await?;
        let resources = self.resources.snapshot().await?;
        let connectivity = self.connectivity_of(&flow);
        let state = run_validation_with(&mut flow, &connectivity, &resources);
        self.flows.save_flow(flow).await?;
        Ok(state)
    }

    pub async fn update_node(&self, flow_id: &str, node_id: &str, patch: &Value) -> Result<FlowNode> {
        self.flows.update_node(flow_id, node_id, patch).await
    }

    pub async fn update_nodes_and_edges(
        &self,
        flow_id: &str,
        nodes: Vec<FlowNode>,
        edges: Vec<FlowEdge>,
    ) -> Result<Flow> {
        self.flows.update_nodes_and_edges(flow_id, nodes, edges).await
    }

    pub async fn update_flow_viewport(&self, flow_id: &str, viewport: Option<Value>) -> Result<()> {
        self.flows.update_flow_viewport(flow_id, viewport).await
    }

    /// Outgoing edge of an If node for an evaluation result
    pub async fn branch(&self, flow_id: &str, node_id: &str, result: bool) -> Result<FlowEdge> {
        let flow = self.flows.get_flow_by_id(flow_id).await?;
        Ok(select_branch(&flow, node_id, result)?.clone())
    }

    /// Drop memoized connectivity for a flow
    pub fn invalidate(&self, flow_id: &str) -> bool {
        self.cache.invalidate(flow_id)
    }

    /// Export a flow with every resource it references
    pub async fn export(&self, flow_id: &str) -> Result<FlowBundle> {
        let flow = self.flows.get_flow_by_id(flow_id).await?;
        let resources = self.resources.snapshot().await?;
        Ok(export_flow(&flow, &resources))
    }

    /// Import a bundle under fresh ids and store it
    pub async fn import(
        &self,
        bundle: FlowBundle,
        model_overrides: &HashMap<String, ModelOverride>,
    ) -> Result<Flow> {
        let imported = import_flow(bundle, model_overrides)?;
        for agent in imported.resources.agents.into_values() {
            self.resources.save_agent(agent).await?;
        }
        for if_node in imported.resources.if_nodes.into_values() {
            self.resources.save_if_node(if_node).await?;
        }
        for node in imported.resources.data_store_nodes.into_values() {
            self.resources.save_data_store_node(node).await?;
        }
        self.flows.save_flow(imported.flow.clone()).await?;
        Ok(imported.flow)
    }

    /// Execute one turn of a stored flow.
    ///
    /// System variables come from the provider; `data_store` holds the
    /// current values. Nothing is persisted here.
    pub async fn run_turn(
        &self,
        flow_id: &str,
        data_store: std::collections::BTreeMap<String, Value>,
        runner: &dyn AgentRunner,
        cancel: &CancelSignal,
    ) -> Result<TurnOutcome> {
        let flow = self.flows.get_flow_by_id(flow_id).await?;
        let resources = self.resources.snapshot().await?;
        let input = TurnInput {
            data_store,
            system: self.system.system_variables(flow_id).await?,
        };
        run_turn(&flow, &resources, input, runner, self.config.max_steps, cancel).await
    }
}
