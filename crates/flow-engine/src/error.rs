//! Error types for the flow engine

use thiserror::Error;

use crate::validation::ValidationIssue;

/// Result type alias using FlowEngineError
pub type Result<T> = std::result::Result<T, FlowEngineError>;

/// Kind of entity a `NotFound` error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Flow,
    Node,
    Edge,
    Agent,
    IfNode,
    DataStoreNode,
    SchemaField,
    PromptMessage,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Flow => "flow",
            Self::Node => "node",
            Self::Edge => "edge",
            Self::Agent => "agent",
            Self::IfNode => "if-node",
            Self::DataStoreNode => "data-store node",
            Self::SchemaField => "schema field",
            Self::PromptMessage => "prompt message",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the flow engine
#[derive(Debug, Error)]
pub enum FlowEngineError {
    /// Flow, node, agent or other resource is missing
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Operation applied to a node or message of the wrong type
    #[error("Type mismatch for '{id}': expected {expected}, found {found}")]
    TypeMismatch {
        id: String,
        expected: String,
        found: String,
    },

    /// Missing expected edge/handle or a dangling reference
    #[error("Graph incomplete: {0}")]
    GraphIncomplete(String),

    /// Unresolvable variable or malformed expression
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),

    /// Caller-detectable validation failure with the aggregated issue list
    #[error("Validation failed with {} issue(s)", .0.len())]
    ValidationFailure(Vec<ValidationIssue>),

    /// Turn was cancelled before completion
    #[error("Turn cancelled")]
    Cancelled,

    /// Step ceiling reached while walking the graph
    #[error("Step limit reached ({0} steps)")]
    StepLimitExceeded(u32),

    /// Bundle written by a newer exporter
    #[error("Unsupported bundle format version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowEngineError {
    /// Create a not-found error
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a type-mismatch error
    pub fn type_mismatch(
        id: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            id: id.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a graph-incomplete error with a message
    pub fn incomplete(msg: impl Into<String>) -> Self {
        Self::GraphIncomplete(msg.into())
    }
}

/// Errors raised while parsing or evaluating a logic/condition expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Unresolved variable '{0}'")]
    UnresolvedVariable(String),

    #[error("Malformed expression at offset {offset}: {message}")]
    Malformed { offset: usize, message: String },

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{name}' expects {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: String,
        found: usize,
    },

    #[error("Cannot apply '{operation}' to {found}")]
    TypeError { operation: String, found: String },

    #[error("Division by zero")]
    DivisionByZero,
}

impl FormulaError {
    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            offset,
            message: message.into(),
        }
    }

    /// Name of the unresolved variable, if this is a resolution failure
    pub fn unresolved_variable(&self) -> Option<&str> {
        match self {
            Self::UnresolvedVariable(name) => Some(name),
            _ => None,
        }
    }
}
