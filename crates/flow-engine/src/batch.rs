//! Per-item outcomes for batch operations
//!
//! Batch operations process every item independently and report an
//! aggregate instead of stopping at the first failure.

use serde::{Deserialize, Serialize};

use crate::error::FlowEngineError;

/// Aggregate status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    Success,
    PartialFailure,
    Failure,
}

/// Outcome of one batch item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    /// Position of the item in the request
    pub index: usize,
    /// Id of the entity the item created, updated or deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Collected outcomes of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<ItemOutcome>,
}

impl BatchOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful item
    pub fn success(&mut self, index: usize, id: impl Into<String>) {
        self.succeeded += 1;
        self.items.push(ItemOutcome {
            index,
            id: Some(id.into()),
            error: None,
        });
    }

    /// Record a failed item
    pub fn failure(&mut self, index: usize, id: Option<String>, error: &FlowEngineError) {
        self.failed += 1;
        self.items.push(ItemOutcome {
            index,
            id,
            error: Some(error.to_string()),
        });
    }

    /// Record the result of one item
    pub fn record(&mut self, index: usize, result: Result<String, FlowEngineError>) {
        match result {
            Ok(id) => self.success(index, id),
            Err(e) => self.failure(index, None, &e),
        }
    }

    /// Aggregate status. An empty batch counts as a success.
    pub fn status(&self) -> BatchStatus {
        match (self.succeeded, self.failed) {
            (_, 0) => BatchStatus::Success,
            (0, _) => BatchStatus::Failure,
            _ => BatchStatus::PartialFailure,
        }
    }
}
