//! End-to-end behaviour of the flow service over the local repositories

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use flow_engine::agent::{MessageRole, PromptMessage, SchemaField, SchemaFieldType};
use flow_engine::{
    Agent, ConditionOperator, DataStoreField, DataStoreNode, DataStoreSchema,
    DataStoreSchemaField, FieldType, Flow, FlowBuilder, FlowEngineError, IfCondition, IfNode,
    ModelOverride, Operand, ReadyState, ResourceStore, VariableRegistry, HANDLE_TRUE,
};
use flow_service::{
    AgentOutput, AgentRunner, CancelSignal, FlowRepository, FlowService, FlowServiceError,
    InMemoryResourceRepository, LocalFlowRepository, ServiceConfig, StaticSystemVariables,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn agent(id: &str, name: &str, structured: bool) -> Agent {
    let mut agent = Agent::new(id, name);
    agent
        .prompt_messages
        .push(PromptMessage::plain(MessageRole::System, "You are {{character}}."));
    if structured {
        agent.enable_structured_output = true;
        agent
            .schema_fields
            .push(SchemaField::new("health_delta", SchemaFieldType::Integer));
    }
    agent
}

fn resources() -> ResourceStore {
    let mut store = ResourceStore::new();
    store.insert_agent(agent("agent-a", "Narrator", true));
    store.insert_agent(agent("agent-c", "Critic", false));
    store.insert_if_node(IfNode::new("if-1", "Hurt?").with_condition(IfCondition::new(
        "c1",
        Operand::variable("narrator.health_delta"),
        ConditionOperator::LessThan,
        Operand::literal(0),
    )));
    store.insert_data_store_node(DataStoreNode::new("ds-1", "Apply damage").with_field(
        DataStoreField::new(
            "fld-1",
            "f-health",
            Some("{{health}} + {{narrator.health_delta}}"),
        ),
    ));
    store
}

/// Start -> A -> If -> (true) B / (false) C -> End
fn story_flow() -> Flow {
    FlowBuilder::new("story", "Story")
        .start("start")
        .agent("a", "agent-a")
        .if_node("if", "if-1")
        .data_store("b", "ds-1")
        .agent("c", "agent-c")
        .end("end")
        .connect("start", "a")
        .connect("a", "if")
        .branch("if", true, "b")
        .branch("if", false, "c")
        .connect("b", "end")
        .connect("c", "end")
        .schema(DataStoreSchema::new(vec![DataStoreSchemaField::new(
            "f-health",
            "health",
            FieldType::Integer,
            json!(50),
        )]))
        .response_template("Health is {{health}}")
        .build()
}

async fn service_with(config: ServiceConfig) -> FlowService {
    service_over(vec![story_flow()], resources(), config).await
}

async fn service_over(flows: Vec<Flow>, store: ResourceStore, config: ServiceConfig) -> FlowService {
    let repo = Arc::new(LocalFlowRepository::new());
    for flow in flows {
        repo.save_flow(flow).await.unwrap();
    }
    let mut system = BTreeMap::new();
    system.insert("character".to_string(), json!("Aria"));
    FlowService::new(
        repo,
        Arc::new(InMemoryResourceRepository::new(store)),
        Arc::new(StaticSystemVariables(system)),
        config,
    )
}

/// Returns a fixed output per agent id
struct ScriptedRunner {
    outputs: HashMap<String, AgentOutput>,
}

impl ScriptedRunner {
    fn with_delta(delta: i64) -> Self {
        let mut structured = Map::new();
        structured.insert("health_delta".into(), json!(delta));
        let mut outputs = HashMap::new();
        outputs.insert(
            "agent-a".to_string(),
            AgentOutput {
                text: "The goblin strikes.".into(),
                structured: Some(structured),
            },
        );
        outputs.insert(
            "agent-c".to_string(),
            AgentOutput {
                text: "Nothing happens.".into(),
                structured: None,
            },
        );
        Self { outputs }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run_agent(
        &self,
        agent: &Agent,
        variables: &VariableRegistry,
    ) -> flow_service::Result<AgentOutput> {
        assert_eq!(variables.value("character"), Some(&json!("Aria")));
        self.outputs
            .get(&agent.id)
            .cloned()
            .ok_or_else(|| FlowServiceError::Agent {
                agent_id: agent.id.clone(),
                message: "no scripted output".into(),
            })
    }
}

/// Cancels the turn, then never answers
struct CancellingRunner {
    cancel: CancelSignal,
}

#[async_trait]
impl AgentRunner for CancellingRunner {
    async fn run_agent(&self, _: &Agent, _: &VariableRegistry) -> flow_service::Result<AgentOutput> {
        self.cancel.cancel();
        std::future::pending::<()>().await;
        Ok(AgentOutput::default())
    }
}

#[tokio::test]
async fn test_connectivity_scenario_and_edge_deletion() {
    init_logging();
    let service = service_with(ServiceConfig::default()).await;

    let map = service.connectivity("story").await.unwrap();
    for id in ["start", "a", "if", "b", "c", "end"] {
        let node = map.get(id).unwrap();
        assert!(node.is_connected_to_start && node.is_connected_to_end, "{}", id);
    }

    let flow = service.get_flow("story").await.unwrap();
    let edges = flow
        .edges
        .iter()
        .filter(|e| !(e.source == "b" && e.target == "end"))
        .cloned()
        .collect();
    service
        .update_nodes_and_edges("story", flow.nodes.clone(), edges)
        .await
        .unwrap();

    let map = service.connectivity("story").await.unwrap();
    let b = map.get("b").unwrap();
    assert!(b.is_connected_to_start);
    assert!(!b.is_connected_to_end);
    assert!(!map.requires_field_validation("b"));
    assert!(map.requires_field_validation("c"));
}

#[tokio::test]
async fn test_cache_follows_fingerprint() {
    let service = service_with(ServiceConfig::default()).await;

    service.connectivity("story").await.unwrap();
    service.connectivity("story").await.unwrap();
    assert_eq!(service.cache().stats().hits, 1);
    assert_eq!(service.cache().stats().misses, 1);

    // Data-only edits keep the fingerprint.
    service
        .update_node("story", "a", &json!({"label": "Narrator"}))
        .await
        .unwrap();
    service.connectivity("story").await.unwrap();
    assert_eq!(service.cache().stats().misses, 1);

    let flow = service.get_flow("story").await.unwrap();
    service
        .update_nodes_and_edges("story", flow.nodes.clone(), Vec::new())
        .await
        .unwrap();
    service.connectivity("story").await.unwrap();
    assert_eq!(service.cache().stats().misses, 2);

    assert!(service.invalidate("story"));
    assert!(!service.invalidate("story"));
}

#[tokio::test]
async fn test_validation_lifecycle() {
    init_logging();
    let service = service_with(ServiceConfig::default()).await;

    let state = service.validate("story").await.unwrap();
    let flow = service.get_flow("story").await.unwrap();
    assert_eq!(state, ReadyState::Ready, "issues: {:?}", flow.validation_issues);

    // A structural edit sends a ready flow back to draft.
    let mut edges = flow.edges.clone();
    edges.retain(|e| e.source_handle.as_deref() != Some(HANDLE_TRUE));
    let updated = service
        .update_nodes_and_edges("story", flow.nodes.clone(), edges)
        .await
        .unwrap();
    assert_eq!(updated.ready_state, ReadyState::Draft);

    // The missing true branch is an error, and the error survives further edits.
    assert_eq!(service.validate("story").await.unwrap(), ReadyState::Error);
    let flow = service.get_flow("story").await.unwrap();
    let updated = service
        .update_nodes_and_edges("story", flow.nodes.clone(), flow.edges.clone())
        .await
        .unwrap();
    assert_eq!(updated.ready_state, ReadyState::Error);

    assert!(matches!(
        service.branch("story", "if", true).await,
        Err(FlowServiceError::Engine(FlowEngineError::GraphIncomplete(_)))
    ));
    assert_eq!(service.branch("story", "if", false).await.unwrap().target, "c");
}

#[tokio::test]
async fn test_turn_applies_delta_on_true_branch() {
    init_logging();
    let service = service_with(ServiceConfig::default()).await;
    let runner = ScriptedRunner::with_delta(-3);

    let outcome = service
        .run_turn("story", BTreeMap::new(), &runner, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.visited, vec!["start", "a", "if", "b", "end"]);
    assert_eq!(outcome.data_store["health"], json!(47));
    assert_eq!(outcome.response, "Health is 47");
    assert_eq!(outcome.steps, 3);
    assert!(outcome.failed_fields.is_empty());
    assert!(outcome.agent_outputs.contains_key("agent-a"));
}

#[tokio::test]
async fn test_turn_ignores_same_named_agent_outside_flow() {
    // Sorts before agent-a and shares its namespace, but no node uses it
    let mut store = resources();
    store.insert_agent(agent("agent-0", "Narrator", true));
    let service = service_over(vec![story_flow()], store, ServiceConfig::default()).await;
    let runner = ScriptedRunner::with_delta(-3);

    let outcome = service
        .run_turn("story", BTreeMap::new(), &runner, &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(outcome.data_store["health"], json!(47));
    assert_eq!(outcome.response, "Health is 47");
}

#[tokio::test]
async fn test_turn_prefers_namespace_twin_that_ran() {
    // Both agents are on the flow; only agent-a runs before the If node.
    let mut flow = story_flow();
    flow.nodes.push(flow_engine::FlowNode::agent("twin", "agent-0", Default::default()));
    let mut store = resources();
    store.insert_agent(agent("agent-0", "Narrator", true));
    let service = service_over(vec![flow], store, ServiceConfig::default()).await;
    let runner = ScriptedRunner::with_delta(-3);

    let outcome = service
        .run_turn("story", BTreeMap::new(), &runner, &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(outcome.data_store["health"], json!(47));
}

#[tokio::test]
async fn test_response_reads_agent_text() {
    let mut flow = story_flow();
    flow.response_template = "{{narrator.text}} Health is {{health}}".to_string();
    let service = service_over(vec![flow], resources(), ServiceConfig::default()).await;
    assert_eq!(service.validate("story").await.unwrap(), ReadyState::Ready);

    let runner = ScriptedRunner::with_delta(-3);
    let outcome = service
        .run_turn("story", BTreeMap::new(), &runner, &CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(outcome.response, "The goblin strikes. Health is 47");
}

#[tokio::test]
async fn test_turn_takes_false_branch() {
    let service = service_with(ServiceConfig::default()).await;
    let runner = ScriptedRunner::with_delta(2);

    let mut current = BTreeMap::new();
    current.insert("health".to_string(), json!(20));
    let outcome = service
        .run_turn("story", current, &runner, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.visited, vec!["start", "a", "if", "c", "end"]);
    assert_eq!(outcome.data_store["health"], json!(20));
    assert_eq!(outcome.response, "Health is 20");
}

#[tokio::test]
async fn test_cancelled_turn_returns_nothing() {
    let service = service_with(ServiceConfig::default()).await;
    let cancel = CancelSignal::new();
    let runner = CancellingRunner {
        cancel: cancel.clone(),
    };

    let result = service.run_turn("story", BTreeMap::new(), &runner, &cancel).await;
    match result {
        Err(e) => assert!(e.is_cancelled()),
        Ok(outcome) => panic!("expected cancellation, got {:?}", outcome),
    }

    // A signal that is already set stops the turn before any agent runs.
    let runner = ScriptedRunner::with_delta(-3);
    let result = service.run_turn("story", BTreeMap::new(), &runner, &cancel).await;
    assert!(result.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn test_step_ceiling() {
    let flows = Arc::new(LocalFlowRepository::new());
    // The If node has no conditions, so AND holds and the loop never exits.
    let looping = FlowBuilder::new("loop", "Loop")
        .start("start")
        .agent("a", "agent-a")
        .if_node("again", "if-empty")
        .end("end")
        .connect("start", "a")
        .connect("a", "again")
        .branch("again", true, "a")
        .branch("again", false, "end")
        .build();
    flows.save_flow(looping).await.unwrap();

    let mut store = resources();
    store.insert_if_node(IfNode::new("if-empty", "Always"));
    let service = FlowService::new(
        flows,
        Arc::new(InMemoryResourceRepository::new(store)),
        Arc::new(StaticSystemVariables(BTreeMap::from([(
            "character".to_string(),
            json!("Aria"),
        )]))),
        ServiceConfig {
            max_steps: 5,
            ..Default::default()
        },
    );

    let runner = ScriptedRunner::with_delta(0);
    let err = service
        .run_turn("loop", BTreeMap::new(), &runner, &CancelSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowServiceError::Engine(FlowEngineError::StepLimitExceeded(5))
    ));
}

#[tokio::test]
async fn test_export_import_with_overrides() {
    let service = service_with(ServiceConfig::default()).await;
    let bundle = service.export("story").await.unwrap();
    assert_eq!(bundle.agents.len(), 2);

    let mut overrides = HashMap::new();
    overrides.insert(
        "agent-a".to_string(),
        ModelOverride {
            provider: "local".into(),
            model_id: "tiny".into(),
        },
    );
    let imported = service.import(bundle, &overrides).await.unwrap();
    assert_ne!(imported.id, "story");

    let node = imported.find_node("a").unwrap();
    let new_agent_id = node.resource_id().unwrap();
    assert_ne!(new_agent_id, "agent-a");

    let stored = service.get_flow(&imported.id).await.unwrap();
    assert_eq!(stored, imported);

    // The copy is runnable against the regenerated resources.
    let state = service.validate(&imported.id).await.unwrap();
    assert_eq!(state, ReadyState::Ready);
}

#[tokio::test]
async fn test_concurrent_edits_to_different_nodes() {
    let service = service_with(ServiceConfig::default()).await;
    let patch_a: Value = json!({"label": "Narrator"});
    let patch_c: Value = json!({"label": "Critic"});

    let (a, c) = tokio::join!(
        service.update_node("story", "a", &patch_a),
        service.update_node("story", "c", &patch_c),
    );
    a.unwrap();
    c.unwrap();

    let flow = service.get_flow("story").await.unwrap();
    assert_eq!(flow.find_node("a").unwrap().data.label(), Some("Narrator"));
    assert_eq!(flow.find_node("c").unwrap().data.label(), Some("Critic"));
    assert_eq!(flow.edges, story_flow().edges);
}
