//! Flow storage with file persistence.
//!
//! Every mutation is a read-current, merge, write-back cycle on a single
//! flow. There is no locking across calls: two updates to different nodes
//! both survive, two updates to the same node are last-write-wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EntityKind, FlowEngineError, Result};
use crate::flow::{Flow, FlowUpdate};
use crate::merge::{merge_node_data, merge_nodes_and_edges};
use crate::readiness::ReadyState;
use crate::types::{check_id, FlowEdge, FlowNode};
use crate::validation::{IssueCode, ValidationIssue};

/// Listing entry for a stored flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub node_count: usize,
    pub ready_state: ReadyState,
    pub updated_at: DateTime<Utc>,
}

/// In-memory flow store with optional file persistence.
///
/// Flows are kept in memory for fast access and, when a directory is
/// configured, written to `<dir>/<flow id>.json` on every change.
///
/// # Example
///
/// ```ignore
/// let mut store = FlowStore::with_persistence(".flows");
/// let count = store.load_from_disk()?;
/// store.save_flow(flow)?;
/// store.update_node(&flow_id, "narrator", &json!({"label": "Narrator"}))?;
/// ```
#[derive(Debug, Default)]
pub struct FlowStore {
    flows: HashMap<String, Flow>,
    persist_path: Option<PathBuf>,
}

impl FlowStore {
    /// Create a new in-memory store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that persists to the given directory.
    ///
    /// The directory is created on first save.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            flows: HashMap::new(),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Load every flow document in the persistence directory.
    ///
    /// Unparseable documents, and documents whose flow id could not be
    /// written back safely, are skipped with a warning. Returns the number
    /// of flows loaded.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(dir) = self.persist_path.as_deref() else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let file_path = entry?.path();
            if file_path.extension().is_none_or(|e| e != FLOW_FILE_EXTENSION) {
                continue;
            }
            let content = std::fs::read_to_string(&file_path)?;
            let flow = match serde_json::from_str::<Flow>(&content) {
                Ok(flow) => flow,
                Err(e) => {
                    log::warn!("Skipping unreadable flow document {:?}: {}", file_path, e);
                    continue;
                }
            };
            if let Some(problem) = check_id(&flow.id) {
                log::warn!("Skipping flow document {:?}: {}", file_path, problem);
                continue;
            }
            log::info!("Loaded flow '{}' ({}) from {:?}", flow.name, flow.id, file_path);
            loaded.push(flow);
        }

        let count = loaded.len();
        self.flows.extend(loaded.into_iter().map(|f| (f.id.clone(), f)));
        Ok(count)
    }

    /// Write one flow document, replacing any previous version in one rename
    fn write_flow_document(&self, flow: &Flow) -> Result<()> {
        let Some(dir) = self.persist_path.as_deref() else {
            return Ok(());
        };

        std::fs::create_dir_all(dir)?;
        let target = flow_document_path(dir, &flow.id)?;
        let staging = target.with_extension("json.partial");
        std::fs::write(&staging, serde_json::to_string_pretty(flow)?)?;
        std::fs::rename(&staging, &target)?;
        log::debug!(
            "Wrote flow '{}' ({} nodes, {:?}) to {:?}",
            flow.id,
            flow.nodes.len(),
            flow.ready_state,
            target
        );
        Ok(())
    }

    fn remove_flow_document(&self, flow_id: &str) -> Result<()> {
        let Some(dir) = self.persist_path.as_deref() else {
            return Ok(());
        };

        let target = flow_document_path(dir, flow_id)?;
        match std::fs::remove_file(&target) {
            Ok(()) => {
                log::debug!("Removed flow document for '{}' at {:?}", flow_id, target);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a flow by id
    pub fn get_flow_by_id(&self, id: &str) -> Result<&Flow> {
        self.flows
            .get(id)
            .ok_or_else(|| FlowEngineError::not_found(EntityKind::Flow, id))
    }

    /// Insert or replace a whole flow
    pub fn save_flow(&mut self, flow: Flow) -> Result<()> {
        require_flow_id(&flow.id)?;
        self.write_flow_document(&flow)?;
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    /// Shallow-merge `patch` into one node's data.
    ///
    /// Only that node's data changes; other nodes, edges and flow-level
    /// fields are left as stored.
    pub fn update_node(&mut self, flow_id: &str, node_id: &str, patch: &Value) -> Result<FlowNode> {
        let flow = self.get_flow_by_id(flow_id)?;
        let node = flow.require_node(node_id)?;
        let merged = merge_node_data(node, patch)?;

        let mut next = flow.clone();
        if let Some(slot) = next.find_node_mut(node_id) {
            slot.data = merged.data.clone();
        }
        self.save_flow(next)?;
        Ok(merged)
    }

    /// Replace the node list (keeping stored data for retained nodes) and
    /// the edge list. Counts as a structural edit for readiness.
    pub fn update_nodes_and_edges(
        &mut self,
        flow_id: &str,
        nodes: Vec<FlowNode>,
        edges: Vec<FlowEdge>,
    ) -> Result<&Flow> {
        let mut next = self.get_flow_by_id(flow_id)?.clone();
        let (nodes, edges) = merge_nodes_and_edges(&next.nodes, nodes, edges);
        next.update(FlowUpdate {
            nodes: Some(nodes),
            edges: Some(edges),
            ..Default::default()
        })?;
        self.save_flow(next)?;
        self.get_flow_by_id(flow_id)
    }

    /// Apply a partial flow update
    pub fn update_flow(&mut self, flow_id: &str, update: FlowUpdate) -> Result<&Flow> {
        let mut next = self.get_flow_by_id(flow_id)?.clone();
        next.update(update)?;
        self.save_flow(next)?;
        self.get_flow_by_id(flow_id)
    }

    /// Store the editor viewport; nothing else changes
    pub fn update_flow_viewport(&mut self, flow_id: &str, viewport: Option<Value>) -> Result<()> {
        let mut next = self.get_flow_by_id(flow_id)?.clone();
        next.viewport = viewport;
        self.save_flow(next)
    }

    /// List stored flows, most recently updated first
    pub fn list_flows(&self) -> Vec<FlowSummary> {
        let mut list: Vec<FlowSummary> = self
            .flows
            .values()
            .map(|f| FlowSummary {
                id: f.id.clone(),
                name: f.name.clone(),
                description: f.description.clone(),
                node_count: f.nodes.len(),
                ready_state: f.ready_state,
                updated_at: f.updated_at,
            })
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Remove a flow. Returns it if it existed.
    pub fn remove_flow(&mut self, id: &str) -> Result<Option<Flow>> {
        require_flow_id(id)?;
        self.remove_flow_document(id)?;
        Ok(self.flows.remove(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.flows.contains_key(id)
    }
}

const FLOW_FILE_EXTENSION: &str = "json";

/// Flow ids name files on disk, so they must stay inside the store directory
fn require_flow_id(flow_id: &str) -> Result<()> {
    match check_id(flow_id) {
        Some(problem) => Err(FlowEngineError::ValidationFailure(vec![ValidationIssue::error(
            IssueCode::MalformedId,
            format!("Flow {}", problem),
        )])),
        None => Ok(()),
    }
}

fn flow_document_path(dir: &Path, flow_id: &str) -> Result<PathBuf> {
    require_flow_id(flow_id)?;
    Ok(dir.join(format!("{}.{}", flow_id, FLOW_FILE_EXTENSION)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowProps;
    use crate::types::Position;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_flow(id: &str) -> Flow {
        let p = Position::default();
        Flow::create(FlowProps {
            id: Some(id.to_string()),
            name: "Story".into(),
            nodes: vec![
                FlowNode::start("start", p),
                FlowNode::agent("narrator", "agent-1", p),
                FlowNode::agent("critic", "agent-2", p),
                FlowNode::end("end", p),
            ],
            edges: vec![
                FlowEdge::new("e1", "start", "narrator"),
                FlowEdge::new("e2", "narrator", "critic"),
                FlowEdge::new("e3", "critic", "end"),
            ],
            response_template: "{{narrator.text}}".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_store() {
        let mut store = FlowStore::new();
        store.save_flow(create_test_flow("flow-1")).unwrap();

        assert!(store.get_flow_by_id("flow-1").is_ok());
        assert!(matches!(
            store.get_flow_by_id("missing"),
            Err(FlowEngineError::NotFound { kind: EntityKind::Flow, .. })
        ));
        assert_eq!(store.list_flows().len(), 1);

        let removed = store.remove_flow("flow-1").unwrap();
        assert!(removed.is_some());
        assert!(!store.contains("flow-1"));
    }

    #[test]
    fn test_update_node_is_isolated() {
        let mut store = FlowStore::new();
        let mut flow = create_test_flow("flow-1");
        flow.ready_state = ReadyState::Ready;
        store.save_flow(flow).unwrap();
        let before = store.get_flow_by_id("flow-1").unwrap().clone();

        store
            .update_node("flow-1", "narrator", &json!({"label": "Narrator"}))
            .unwrap();
        let after = store.get_flow_by_id("flow-1").unwrap();

        assert_eq!(after.find_node("narrator").unwrap().data.label(), Some("Narrator"));
        assert_eq!(after.find_node("critic"), before.find_node("critic"));
        assert_eq!(after.edges, before.edges);
        assert_eq!(after.ready_state, ReadyState::Ready);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn test_update_node_is_idempotent() {
        let mut store = FlowStore::new();
        store.save_flow(create_test_flow("flow-1")).unwrap();
        let patch = json!({"tags": ["hero"], "label": "Narrator"});

        store.update_node("flow-1", "narrator", &patch).unwrap();
        let once = store.get_flow_by_id("flow-1").unwrap().clone();
        store.update_node("flow-1", "narrator", &patch).unwrap();
        let twice = store.get_flow_by_id("flow-1").unwrap();

        assert_eq!(&once, twice);
    }

    #[test]
    fn test_sequential_updates_to_different_nodes_both_survive() {
        let mut store = FlowStore::new();
        store.save_flow(create_test_flow("flow-1")).unwrap();

        store.update_node("flow-1", "narrator", &json!({"label": "N"})).unwrap();
        store.update_node("flow-1", "critic", &json!({"label": "C"})).unwrap();

        let flow = store.get_flow_by_id("flow-1").unwrap();
        assert_eq!(flow.find_node("narrator").unwrap().data.label(), Some("N"));
        assert_eq!(flow.find_node("critic").unwrap().data.label(), Some("C"));
    }

    #[test]
    fn test_update_nodes_and_edges_preserves_data() {
        let mut store = FlowStore::new();
        let mut flow = create_test_flow("flow-1");
        flow.ready_state = ReadyState::Ready;
        store.save_flow(flow).unwrap();
        store.update_node("flow-1", "narrator", &json!({"label": "Narrator"})).unwrap();

        let p = Position::new(10.0, 10.0);
        let nodes = vec![
            FlowNode::start("start", p),
            FlowNode::agent("narrator", "stale", p),
            FlowNode::end("end", p),
        ];
        let edges = vec![
            FlowEdge::new("e1", "start", "narrator"),
            FlowEdge::new("e4", "narrator", "end"),
        ];
        let flow = store.update_nodes_and_edges("flow-1", nodes, edges).unwrap();

        let narrator = flow.find_node("narrator").unwrap();
        assert_eq!(narrator.resource_id(), Some("agent-1"));
        assert_eq!(narrator.data.label(), Some("Narrator"));
        assert_eq!(narrator.position, p);
        assert!(flow.find_node("critic").is_none());
        assert_eq!(flow.edges.len(), 2);
        assert_eq!(flow.ready_state, ReadyState::Draft);
    }

    #[test]
    fn test_update_node_errors() {
        let mut store = FlowStore::new();
        store.save_flow(create_test_flow("flow-1")).unwrap();
        assert!(matches!(
            store.update_node("flow-1", "ghost", &json!({})),
            Err(FlowEngineError::NotFound { kind: EntityKind::Node, .. })
        ));
        assert!(store.update_node("nope", "start", &json!({})).is_err());
    }

    #[test]
    fn test_viewport_update() {
        let mut store = FlowStore::new();
        store.save_flow(create_test_flow("flow-1")).unwrap();
        store
            .update_flow_viewport("flow-1", Some(json!({"x": 1, "y": 2, "zoom": 0.5})))
            .unwrap();
        let flow = store.get_flow_by_id("flow-1").unwrap();
        assert_eq!(flow.viewport.as_ref().unwrap()["zoom"], 0.5);
        assert_eq!(flow.nodes.len(), 4);
    }

    #[test]
    fn test_persistent_store() {
        let temp_dir = TempDir::new().unwrap();
        let persist_path = temp_dir.path().join("flows");

        {
            let mut store = FlowStore::with_persistence(&persist_path);
            store.save_flow(create_test_flow("persist-test")).unwrap();
            store
                .update_node("persist-test", "narrator", &json!({"label": "Narrator"}))
                .unwrap();
        }

        {
            let mut store = FlowStore::with_persistence(&persist_path);
            let count = store.load_from_disk().unwrap();
            assert_eq!(count, 1);
            let flow = store.get_flow_by_id("persist-test").unwrap();
            assert_eq!(flow.find_node("narrator").unwrap().data.label(), Some("Narrator"));

            store.remove_flow("persist-test").unwrap();
            assert!(!persist_path.join("persist-test.json").exists());
            assert!(store.remove_flow("persist-test").unwrap().is_none());
        }
    }

    #[test]
    fn test_flow_ids_cannot_escape_the_store_directory() {
        let temp_dir = TempDir::new().unwrap();
        let persist_path = temp_dir.path().join("flows");
        let mut store = FlowStore::with_persistence(&persist_path);

        let mut flow = create_test_flow("inside");
        flow.id = "../escape".to_string();
        let err = store.save_flow(flow).unwrap_err();
        assert!(matches!(
            err,
            FlowEngineError::ValidationFailure(ref issues) if issues[0].code == IssueCode::MalformedId
        ));
        assert!(!temp_dir.path().join("escape.json").exists());
        assert!(!store.contains("../escape"));

        std::fs::write(temp_dir.path().join("victim.json"), "{}").unwrap();
        assert!(store.remove_flow("../victim").is_err());
        assert!(temp_dir.path().join("victim.json").exists());

        // In-memory stores apply the same rule
        let mut flow = create_test_flow("inside");
        flow.id = "a/b".to_string();
        assert!(FlowStore::new().save_flow(flow).is_err());
    }

    #[test]
    fn test_load_skips_documents_with_unsafe_ids() {
        let temp_dir = TempDir::new().unwrap();
        let persist_path = temp_dir.path().join("flows");
        {
            let mut store = FlowStore::with_persistence(&persist_path);
            store.save_flow(create_test_flow("good")).unwrap();
        }
        let mut smuggled = create_test_flow("good");
        smuggled.id = "../../elsewhere".to_string();
        std::fs::write(
            persist_path.join("smuggled.json"),
            serde_json::to_string(&smuggled).unwrap(),
        )
        .unwrap();
        std::fs::write(persist_path.join("broken.json"), "not json").unwrap();

        let mut store = FlowStore::with_persistence(&persist_path);
        assert_eq!(store.load_from_disk().unwrap(), 1);
        assert!(store.contains("good"));
        assert!(!persist_path.join("good.json.partial").exists());
    }
}
