//! Per-turn flow execution
//!
//! Walks a flow from Start to End once: agents run through an
//! [`AgentRunner`], If nodes pick a branch, DataStore nodes recompute their
//! fields. The walk is bounded by a step ceiling and observes a
//! [`CancelSignal`]. Nothing is committed until the walk reaches End, so a
//! cancelled or failed turn leaves no partial data-store state behind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;

use flow_engine::formula::render_template;
use flow_engine::{
    evaluate_if_node, resolve_data_store_node, select_branch, Agent, Flow, FlowEngineError,
    NodeType, ResourceStore, VariableRegistry,
};

use crate::error::Result;

/// Cooperative cancellation shared between a turn and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the turn. In-flight agent calls are dropped.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn check(&self) -> std::result::Result<(), FlowEngineError> {
        if self.is_cancelled() {
            Err(FlowEngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What one agent produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub text: String,
    /// Structured output, keyed by schema field name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Map<String, Value>>,
}

/// Calls the model for one agent step
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_agent(&self, agent: &Agent, variables: &VariableRegistry) -> Result<AgentOutput>;
}

/// State a turn starts from
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    /// Current data-store values keyed by field name
    pub data_store: BTreeMap<String, Value>,
    pub system: BTreeMap<String, Value>,
}

/// Everything a completed turn produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    /// Rendered response template
    pub response: String,
    /// Data-store values to commit
    pub data_store: BTreeMap<String, Value>,
    /// Agent outputs keyed by agent id
    pub agent_outputs: BTreeMap<String, AgentOutput>,
    /// Node ids in execution order, Start and End included
    pub visited: Vec<String>,
    pub steps: u32,
    /// Data-store fields that kept their previous value because their formula failed
    pub failed_fields: Vec<String>,
}

struct TurnState<'a> {
    flow: &'a Flow,
    /// Agents referenced by the flow's Agent nodes, in node order
    agents: Vec<&'a Agent>,
    input: &'a TurnInput,
    data_store: BTreeMap<String, Value>,
    agent_outputs: BTreeMap<String, AgentOutput>,
}

impl<'a> TurnState<'a> {
    fn new(flow: &'a Flow, resources: &'a ResourceStore, input: &'a TurnInput) -> Self {
        let mut agents: Vec<&Agent> = Vec::new();
        for node in flow.nodes.iter().filter(|n| n.node_type() == NodeType::Agent) {
            // A dangling reference fails the turn when the walk reaches that node
            let Ok(agent) = resources.agent_for_node(flow, &node.id) else {
                continue;
            };
            if !agents.iter().any(|a| a.id == agent.id) {
                agents.push(agent);
            }
        }
        Self {
            flow,
            agents,
            input,
            data_store: input.data_store.clone(),
            agent_outputs: BTreeMap::new(),
        }
    }

    /// Registry over the current state. Agents that already ran come first so
    /// their output wins over a namespace twin that has not.
    fn registry(&self) -> VariableRegistry {
        let mut builder = VariableRegistry::builder()
            .system(&self.input.system)
            .data_store(self.flow.data_store_schema.as_ref(), &self.data_store);
        let (ran, pending): (Vec<&Agent>, Vec<&Agent>) = self
            .agents
            .iter()
            .copied()
            .partition(|a| self.agent_outputs.contains_key(&a.id));
        for agent in ran.into_iter().chain(pending) {
            let output = self.agent_outputs.get(&agent.id);
            builder = builder
                .agent_output(agent, output.and_then(|o| o.structured.as_ref()))
                .agent_text(agent, output.map(|o| o.text.as_str()));
        }
        builder.build()
    }
}

/// Run one turn of `flow`.
///
/// Every node executed after Start counts as a step; exceeding `max_steps`
/// fails the turn with `StepLimitExceeded`.
pub async fn run_turn(
    flow: &Flow,
    resources: &ResourceStore,
    input: TurnInput,
    runner: &dyn AgentRunner,
    max_steps: u32,
    cancel: &CancelSignal,
) -> Result<TurnOutcome> {
    let start = flow
        .start_node()
        .ok_or_else(|| FlowEngineError::incomplete("flow has no start node"))?;

    let mut state = TurnState::new(flow, resources, &input);
    let mut visited = vec![start.id.clone()];
    let mut failed_fields = Vec::new();
    let mut steps = 0u32;
    let mut current = next_node(flow, &start.id)?;

    log::debug!("Turn started on flow '{}'", flow.id);
    loop {
        cancel.check()?;
        let node = flow.require_node(&current)?;
        visited.push(node.id.clone());

        if node.node_type() == NodeType::End {
            let response = render_template(&flow.response_template, &state.registry())
                .map_err(FlowEngineError::from)?;
            log::info!(
                "Turn on flow '{}' finished after {} step(s)",
                flow.id,
                steps
            );
            return Ok(TurnOutcome {
                response,
                data_store: state.data_store,
                agent_outputs: state.agent_outputs,
                visited,
                steps,
                failed_fields,
            });
        }

        steps += 1;
        if steps > max_steps {
            log::warn!("Turn on flow '{}' hit the step limit ({})", flow.id, max_steps);
            return Err(FlowEngineError::StepLimitExceeded(max_steps).into());
        }

        current = match node.node_type() {
            NodeType::Agent => {
                let agent = resources.agent_for_node(flow, &node.id)?;
                let registry = state.registry();
                let output = tokio::select! {
                    _ = cancel.cancelled() => {
                        log::info!("Turn on flow '{}' cancelled during agent '{}'", flow.id, agent.id);
                        return Err(FlowEngineError::Cancelled.into());
                    }
                    result = runner.run_agent(agent, &registry) => result?,
                };
                state.agent_outputs.insert(agent.id.clone(), output);
                next_node(flow, &node.id)?
            }
            NodeType::If => {
                let config = resources.if_node_for_node(flow, &node.id)?;
                let result =
                    evaluate_if_node(config, &state.registry()).map_err(FlowEngineError::from)?;
                select_branch(flow, &node.id, result)?.target.clone()
            }
            NodeType::DataStore => {
                let config = resources.data_store_node_for_node(flow, &node.id)?;
                if let Some(schema) = flow.data_store_schema.as_ref() {
                    let resolution =
                        resolve_data_store_node(schema, config, &state.data_store, &state.registry());
                    cancel.check()?;
                    failed_fields.extend(resolution.failures.iter().map(|f| f.field_id.clone()));
                    state.data_store = resolution.values;
                }
                next_node(flow, &node.id)?
            }
            NodeType::Start | NodeType::End => next_node(flow, &node.id)?,
        };
    }
}

fn next_node(flow: &Flow, node_id: &str) -> std::result::Result<String, FlowEngineError> {
    flow.outgoing_edges(node_id)
        .next()
        .map(|e| e.target.clone())
        .ok_or_else(|| FlowEngineError::incomplete(format!("node '{}' has no outgoing edge", node_id)))
}
