//! Agent configuration model
//!
//! An agent is a configured LLM-calling step: a list of prompt messages
//! (with at most one distinguished history slot) and an optional
//! structured-output schema whose fields become `namespace.field`
//! variables for downstream formulas and conditions.

mod prompt;
mod schema;

pub use prompt::{
    apply_prompt_message_ops, normalize_prompt_messages, HistoryMessage, HistoryType,
    MessageRole, PlainMessage, PromptBlock, PromptMessage, PromptMessageOp, RoleMapping,
};
pub use schema::{apply_schema_field_ops, SchemaField, SchemaFieldOp, SchemaFieldType};

use serde::{Deserialize, Serialize};

use crate::variables::snake_case;

/// Model size class the agent runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelTier {
    #[default]
    Light,
    Heavy,
}

/// Explicit provider/model choice overriding the tier default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOverride {
    pub provider: String,
    pub model_id: String,
}

/// A configured agent resource, referenced by Agent nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt_messages: Vec<PromptMessage>,
    /// Whether `schema_fields` are requested from the model and exposed as variables
    #[serde(default)]
    pub enable_structured_output: bool,
    #[serde(default)]
    pub schema_fields: Vec<SchemaField>,
    #[serde(default)]
    pub model_tier: ModelTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<ModelOverride>,
}

impl Agent {
    /// Create an agent with no messages and no output schema
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            prompt_messages: Vec::new(),
            enable_structured_output: false,
            schema_fields: Vec::new(),
            model_tier: ModelTier::default(),
            model_override: None,
        }
    }

    /// Variable namespace for this agent's outputs (snake-cased name)
    pub fn namespace(&self) -> String {
        snake_case(&self.name)
    }

    /// The history slot and its position, if the agent has one
    pub fn history_message(&self) -> Option<(usize, &HistoryMessage)> {
        self.prompt_messages
            .iter()
            .enumerate()
            .find_map(|(i, m)| match m {
                PromptMessage::History(h) => Some((i, h)),
                PromptMessage::Plain(_) => None,
            })
    }

    /// Install or replace the history slot.
    ///
    /// An existing slot is replaced in place; otherwise the message is
    /// inserted at `index` (clamped) or appended.
    pub fn set_history_message(&mut self, history: HistoryMessage, index: Option<usize>) {
        match self.history_message().map(|(i, _)| i) {
            Some(existing) => self.prompt_messages[existing] = PromptMessage::History(history),
            None => {
                let at = index
                    .unwrap_or(self.prompt_messages.len())
                    .min(self.prompt_messages.len());
                self.prompt_messages.insert(at, PromptMessage::History(history));
            }
        }
        normalize_prompt_messages(&mut self.prompt_messages);
    }

    /// Remove the history slot, returning it
    pub fn remove_history_message(&mut self) -> Option<HistoryMessage> {
        let index = self.history_message()?.0;
        match self.prompt_messages.remove(index) {
            PromptMessage::History(h) => Some(h),
            PromptMessage::Plain(_) => None,
        }
    }

    /// Find an output field by its (already normalized) name
    pub fn find_schema_field(&self, name: &str) -> Option<&SchemaField> {
        self.schema_fields.iter().find(|f| f.name == name)
    }
}
