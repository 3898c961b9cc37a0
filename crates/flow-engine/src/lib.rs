//! Flow Engine - Agent flow graphs for interactive storytelling
//!
//! This crate holds the synchronous core of an agent pipeline editor and
//! runtime. It supports:
//!
//! - Typed flow documents (Start, End, Agent, If and DataStore nodes)
//! - Connectivity traversal with a fingerprint-keyed cache
//! - Readiness tracking and an aggregated validation rule set
//! - If-node condition evaluation and branch selection
//! - A sandboxed formula language for data-store field updates
//! - Targeted node updates that never clobber unrelated edits
//! - Flow import/export with id regeneration
//!
//! # Architecture
//!
//! Everything here is plain data plus pure functions. Nodes reference their
//! configuration (agents, if-node conditions, data-store formulas) by id;
//! those live in a [`ResourceStore`]. Async persistence, turn execution and
//! cache ownership belong to the `flow-service` crate.
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::{compute_connectivity, run_validation, FlowBuilder};
//!
//! let mut flow = FlowBuilder::new("flow-1", "Story")
//!     .start("start")
//!     .agent("narrator", "agent-1")
//!     .end("end")
//!     .connect("start", "narrator")
//!     .connect("narrator", "end")
//!     .build();
//! let state = run_validation(&mut flow, &resources);
//! ```

pub mod agent;
pub mod batch;
pub mod builder;
pub mod condition;
pub mod datastore;
pub mod error;
pub mod flow;
pub mod formula;
pub mod merge;
pub mod readiness;
pub mod resources;
pub mod store;
pub mod transfer;
pub mod traversal;
pub mod types;
pub mod validation;
pub mod variables;

// Re-export key types
pub use agent::{Agent, ModelOverride, ModelTier, PromptMessage, SchemaField};
pub use batch::{BatchOutcome, BatchStatus, ItemOutcome};
pub use builder::FlowBuilder;
pub use condition::{
    evaluate_condition, evaluate_if_node, select_branch, ConditionOperator, IfCondition, IfNode,
    LogicOperator, Operand,
};
pub use datastore::{DataStoreField, DataStoreNode, DataStoreSchema, DataStoreSchemaField, FieldType};
pub use error::{EntityKind, FlowEngineError, FormulaError, Result};
pub use flow::{Flow, FlowProps, FlowUpdate};
pub use formula::{resolve_data_store_node, DataStoreResolution};
pub use merge::{merge_node_data, merge_nodes, merge_nodes_and_edges};
pub use readiness::{next_ready_state, ReadyState};
pub use resources::ResourceStore;
pub use store::{FlowStore, FlowSummary};
pub use transfer::{export_flow, import_flow, FlowBundle, ImportedFlow};
pub use traversal::{
    compute_connectivity, ConnectivityMap, NodeConnectivity, StructuralFingerprint, TraversalCache,
};
pub use types::{FlowEdge, FlowNode, NodeData, NodeType, Position, HANDLE_FALSE, HANDLE_TRUE};
pub use validation::{run_validation, validate_flow, IssueCode, IssueSeverity, ValidationIssue};
pub use variables::{VariableLookup, VariableRegistry, VariableSource};
