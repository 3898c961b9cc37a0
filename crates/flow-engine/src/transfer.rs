//! Flow import and export
//!
//! A bundle is a flow plus the resources its nodes reference. Importing a
//! bundle always produces fresh ids for the flow and every resource, so the
//! same file can be imported repeatedly without collisions. Node ids and
//! edges are kept as they are.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, ModelOverride};
use crate::condition::IfNode;
use crate::datastore::DataStoreNode;
use crate::error::{FlowEngineError, Result};
use crate::flow::Flow;
use crate::readiness::ReadyState;
use crate::resources::ResourceStore;
use crate::types::NodeType;

/// Bundle layout version written by [`export_flow`]
pub const FORMAT_VERSION: u32 = 1;

/// Self-contained export of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowBundle {
    pub format_version: u32,
    pub flow: Flow,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub if_nodes: Vec<IfNode>,
    #[serde(default)]
    pub data_store_nodes: Vec<DataStoreNode>,
}

/// Result of importing a bundle
#[derive(Debug, Clone)]
pub struct ImportedFlow {
    pub flow: Flow,
    pub resources: ResourceStore,
    /// Original agent id to regenerated agent id
    pub agent_ids: BTreeMap<String, String>,
    /// Nodes whose reference was not in the bundle and has been cleared
    pub unresolved_nodes: Vec<String>,
}

/// Collect a flow and the resources its nodes reference.
///
/// References that do not resolve are skipped; validation already reports
/// them on the flow.
pub fn export_flow(flow: &Flow, resources: &ResourceStore) -> FlowBundle {
    let mut agents = BTreeMap::new();
    let mut if_nodes = BTreeMap::new();
    let mut data_store_nodes = BTreeMap::new();

    for node in &flow.nodes {
        let Some(id) = node.resource_id() else {
            continue;
        };
        let found = match node.node_type() {
            NodeType::Agent => resources
                .agent(id)
                .map(|a| agents.insert(a.id.clone(), a.clone()))
                .is_ok(),
            NodeType::If => resources
                .if_node(id)
                .map(|c| if_nodes.insert(c.id.clone(), c.clone()))
                .is_ok(),
            NodeType::DataStore => resources
                .data_store_node(id)
                .map(|d| data_store_nodes.insert(d.id.clone(), d.clone()))
                .is_ok(),
            NodeType::Start | NodeType::End => true,
        };
        if !found {
            log::warn!(
                "Export of flow '{}': node '{}' references missing {} '{}'",
                flow.id,
                node.id,
                node.node_type(),
                id
            );
        }
    }

    log::info!(
        "Exported flow '{}' with {} agent(s), {} if-node(s), {} data-store node(s)",
        flow.id,
        agents.len(),
        if_nodes.len(),
        data_store_nodes.len()
    );
    FlowBundle {
        format_version: FORMAT_VERSION,
        flow: flow.clone(),
        agents: agents.into_values().collect(),
        if_nodes: if_nodes.into_values().collect(),
        data_store_nodes: data_store_nodes.into_values().collect(),
    }
}

/// Import a bundle under fresh ids.
///
/// `model_overrides` is keyed by the agent ids as they appear in the bundle.
/// The imported flow starts in `Draft` with no validation issues. Node
/// references the bundle cannot satisfy are emptied and listed in
/// [`ImportedFlow::unresolved_nodes`]; validation reports them as missing.
pub fn import_flow(
    bundle: FlowBundle,
    model_overrides: &HashMap<String, ModelOverride>,
) -> Result<ImportedFlow> {
    if bundle.format_version > FORMAT_VERSION {
        return Err(FlowEngineError::UnsupportedVersion {
            found: bundle.format_version,
            supported: FORMAT_VERSION,
        });
    }

    let mut resources = ResourceStore::new();
    let mut agent_ids = BTreeMap::new();
    let mut if_ids = HashMap::new();
    let mut data_store_ids = HashMap::new();

    for mut agent in bundle.agents {
        if let Some(choice) = model_overrides.get(&agent.id) {
            agent.model_override = Some(choice.clone());
        }
        let new_id = new_id();
        agent_ids.insert(std::mem::replace(&mut agent.id, new_id.clone()), new_id);
        resources.insert_agent(agent);
    }
    for mut config in bundle.if_nodes {
        let new_id = new_id();
        if_ids.insert(std::mem::replace(&mut config.id, new_id.clone()), new_id);
        resources.insert_if_node(config);
    }
    for mut config in bundle.data_store_nodes {
        let new_id = new_id();
        data_store_ids.insert(std::mem::replace(&mut config.id, new_id.clone()), new_id);
        resources.insert_data_store_node(config);
    }

    let mut flow = bundle.flow;
    let original_id = std::mem::replace(&mut flow.id, new_id());
    // Missing references are cleared rather than kept, so they cannot bind
    // to an unrelated resource that happens to share the old id.
    let mut unresolved_nodes = Vec::new();
    for node in &mut flow.nodes {
        let Some(old) = node.resource_id() else {
            continue;
        };
        let mapped = match node.node_type() {
            NodeType::Agent => agent_ids.get(old),
            NodeType::If => if_ids.get(old),
            NodeType::DataStore => data_store_ids.get(old),
            NodeType::Start | NodeType::End => None,
        };
        match mapped {
            Some(new) => node.data.set_resource_id(new.clone()),
            None => {
                log::warn!(
                    "Import of flow '{}': node '{}' references '{}' which is not in the bundle",
                    original_id,
                    node.id,
                    old
                );
                unresolved_nodes.push(node.id.clone());
                node.data.set_resource_id(String::new());
            }
        }
    }

    let now = Utc::now();
    flow.ready_state = ReadyState::Draft;
    flow.validation_issues.clear();
    flow.vibe_session_id = None;
    flow.created_at = now;
    flow.updated_at = now;

    log::info!("Imported flow '{}' as '{}'", original_id, flow.id);
    Ok(ImportedFlow {
        flow,
        resources,
        agent_ids,
        unresolved_nodes,
    })
}

/// Write a bundle as pretty-printed JSON
pub fn write_bundle(bundle: &FlowBundle, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(bundle)?)?;
    log::debug!("Wrote flow bundle to {:?}", path);
    Ok(())
}

/// Read a bundle written by [`write_bundle`]
pub fn read_bundle(path: impl AsRef<Path>) -> Result<FlowBundle> {
    let content = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&content)?)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
