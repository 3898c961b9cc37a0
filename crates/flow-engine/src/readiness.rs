//! Flow readiness state machine

use serde::{Deserialize, Serialize};

use crate::flow::FlowUpdate;

/// Validation status of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadyState {
    /// Edited since it last validated
    #[default]
    Draft,
    /// Last validation found no errors
    Ready,
    /// Last validation found errors
    Error,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Draft => "draft",
            ReadyState::Ready => "ready",
            ReadyState::Error => "error",
        }
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State after applying `update` to a flow currently in `current`.
///
/// An explicit `readyState` in the update wins. Otherwise a structural edit
/// (nodes, edges or response template) sends `Ready` back to `Draft`.
/// `Error` is left alone until validation runs again.
pub fn next_ready_state(current: ReadyState, update: &FlowUpdate) -> ReadyState {
    if let Some(explicit) = update.ready_state {
        return explicit;
    }
    match current {
        ReadyState::Ready if update.is_structural() => ReadyState::Draft,
        other => other,
    }
}
