//! Prompt messages and their batch upsert operations

use serde::{Deserialize, Serialize};

use crate::batch::BatchOutcome;
use crate::error::{EntityKind, FlowEngineError, Result};

use super::Agent;

/// Role of a prompt message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A templated fragment of a message's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptBlock {
    pub id: String,
    pub template: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl PromptBlock {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            template: template.into(),
            enabled: true,
        }
    }
}

/// A fixed-role message built from prompt blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainMessage {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub blocks: Vec<PromptBlock>,
}

impl PlainMessage {
    /// Content of the enabled blocks, joined by newlines
    pub fn content(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.enabled)
            .map(|b| b.template.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replace the content with a single block
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.blocks = vec![PromptBlock::new(content)];
    }
}

/// Which conversation turns a history slot renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryType {
    /// Every turn inside the window
    #[default]
    Conversation,
    /// Only the most recent turn inside the window
    LastTurn,
}

/// Roles the rendered history turns are emitted as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMapping {
    pub user: MessageRole,
    pub assistant: MessageRole,
}

impl Default for RoleMapping {
    fn default() -> Self {
        Self {
            user: MessageRole::User,
            assistant: MessageRole::Assistant,
        }
    }
}

/// The distinguished history slot of an agent's prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: String,
    #[serde(default)]
    pub history_type: HistoryType,
    /// First turn of the window (inclusive)
    #[serde(default)]
    pub start: usize,
    /// Last turn of the window (exclusive). `None` means open-ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    /// Count `start`/`end` back from the most recent turn
    #[serde(default)]
    pub count_from_end: bool,
    #[serde(default)]
    pub user_blocks: Vec<PromptBlock>,
    #[serde(default)]
    pub assistant_blocks: Vec<PromptBlock>,
    #[serde(default)]
    pub role_mapping: RoleMapping,
}

impl HistoryMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history_type: HistoryType::default(),
            start: 0,
            end: None,
            count_from_end: false,
            user_blocks: Vec::new(),
            assistant_blocks: Vec::new(),
            role_mapping: RoleMapping::default(),
        }
    }

    /// Turn indices this slot renders out of `total` recorded turns
    pub fn window(&self, total: usize) -> std::ops::Range<usize> {
        let (from, to) = if self.count_from_end {
            let to = total.saturating_sub(self.start);
            let from = self.end.map_or(0, |end| total.saturating_sub(end));
            (from, to)
        } else {
            (self.start.min(total), self.end.unwrap_or(total).min(total))
        };
        if from >= to {
            return from..from;
        }
        match self.history_type {
            HistoryType::Conversation => from..to,
            HistoryType::LastTurn => (to - 1)..to,
        }
    }
}

/// One entry of an agent's prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PromptMessage {
    Plain(PlainMessage),
    History(HistoryMessage),
}

impl PromptMessage {
    /// Plain message with a fresh id and one block of content
    pub fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        PromptMessage::Plain(PlainMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            blocks: vec![PromptBlock::new(content)],
        })
    }

    pub fn id(&self) -> &str {
        match self {
            PromptMessage::Plain(m) => &m.id,
            PromptMessage::History(h) => &h.id,
        }
    }

    /// Role of a plain message; `None` for the history slot
    pub fn role(&self) -> Option<MessageRole> {
        match self {
            PromptMessage::Plain(m) => Some(m.role),
            PromptMessage::History(_) => None,
        }
    }
}

/// Restore the prompt invariants in place.
///
/// Only the first message may carry the system role; later system messages
/// are demoted to user. Only the first history slot is kept.
pub fn normalize_prompt_messages(messages: &mut Vec<PromptMessage>) {
    let mut seen_history = false;
    messages.retain(|m| match m {
        PromptMessage::History(_) if seen_history => false,
        PromptMessage::History(_) => {
            seen_history = true;
            true
        }
        PromptMessage::Plain(_) => true,
    });

    for (i, message) in messages.iter_mut().enumerate() {
        if let PromptMessage::Plain(plain) = message {
            if i > 0 && plain.role == MessageRole::System {
                log::debug!("Demoting system message '{}' at index {} to user", plain.id, i);
                plain.role = MessageRole::User;
            }
        }
    }
}

/// One item of a prompt-message batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptMessageOp {
    pub role: Option<MessageRole>,
    pub content: Option<String>,
    pub message_id: Option<String>,
    /// Insert position for new messages (clamped to the list length)
    pub index: Option<usize>,
    pub delete: bool,
}

/// Apply a batch of prompt-message upserts and deletes to an agent.
///
/// Items are independent: a failing item is reported and the rest still
/// apply. The prompt is normalized once after the batch.
pub fn apply_prompt_message_ops(agent: &mut Agent, ops: &[PromptMessageOp]) -> BatchOutcome {
    let mut outcome = BatchOutcome::new();
    for (index, op) in ops.iter().enumerate() {
        match apply_one(&mut agent.prompt_messages, op) {
            Ok(id) => outcome.success(index, id),
            Err(e) => {
                log::warn!("Prompt op {} on agent '{}' failed: {}", index, agent.id, e);
                outcome.failure(index, op.message_id.clone(), &e);
            }
        }
    }
    normalize_prompt_messages(&mut agent.prompt_messages);
    outcome
}

fn apply_one(messages: &mut Vec<PromptMessage>, op: &PromptMessageOp) -> Result<String> {
    let position = op
        .message_id
        .as_deref()
        .and_then(|id| messages.iter().position(|m| m.id() == id));

    if op.delete {
        let id = op
            .message_id
            .as_deref()
            .ok_or_else(|| FlowEngineError::incomplete("delete requires a messageId"))?;
        let at = position.ok_or_else(|| FlowEngineError::not_found(EntityKind::PromptMessage, id))?;
        messages.remove(at);
        return Ok(id.to_string());
    }

    if let Some(at) = position {
        return match &mut messages[at] {
            PromptMessage::Plain(plain) => {
                if let Some(role) = op.role {
                    plain.role = role;
                }
                if let Some(content) = &op.content {
                    plain.set_content(content.clone());
                }
                Ok(plain.id.clone())
            }
            PromptMessage::History(h) => {
                Err(FlowEngineError::type_mismatch(&h.id, "plain message", "history message"))
            }
        };
    }

    let (Some(role), Some(content)) = (op.role, op.content.as_ref()) else {
        return Err(FlowEngineError::incomplete(
            "new prompt message requires role and content",
        ));
    };
    let id = op
        .message_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let message = PromptMessage::Plain(PlainMessage {
        id: id.clone(),
        role,
        blocks: vec![PromptBlock::new(content.clone())],
    });
    let at = op.index.unwrap_or(messages.len()).min(messages.len());
    messages.insert(at, message);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchStatus;

    fn agent_with_three_messages() -> Agent {
        let mut agent = Agent::new("agent-1", "Narrator");
        agent.prompt_messages = vec![
            PromptMessage::plain(MessageRole::System, "You narrate."),
            PromptMessage::plain(MessageRole::User, "Scene: {{scene}}"),
            PromptMessage::plain(MessageRole::Assistant, "Understood."),
        ];
        agent
    }

    #[test]
    fn test_system_message_is_demoted_after_first_position() {
        let mut agent = agent_with_three_messages();
        let ops = vec![PromptMessageOp {
            role: Some(MessageRole::System),
            content: Some("Stay in character.".into()),
            index: Some(2),
            ..Default::default()
        }];

        let outcome = apply_prompt_message_ops(&mut agent, &ops);
        assert_eq!(outcome.status(), BatchStatus::Success);
        assert_eq!(agent.prompt_messages.len(), 4);
        assert_eq!(agent.prompt_messages[2].role(), Some(MessageRole::User));
        assert_eq!(agent.prompt_messages[0].role(), Some(MessageRole::System));
    }

    #[test]
    fn test_update_delete_and_partial_failure() {
        let mut agent = agent_with_three_messages();
        let user_id = agent.prompt_messages[1].id().to_string();
        let assistant_id = agent.prompt_messages[2].id().to_string();

        let ops = vec![
            PromptMessageOp {
                message_id: Some(user_id.clone()),
                content: Some("Scene: {{location}}".into()),
                ..Default::default()
            },
            PromptMessageOp {
                message_id: Some(assistant_id),
                delete: true,
                ..Default::default()
            },
            PromptMessageOp {
                message_id: Some("missing".into()),
                delete: true,
                ..Default::default()
            },
            PromptMessageOp {
                content: Some("no role".into()),
                ..Default::default()
            },
        ];

        let outcome = apply_prompt_message_ops(&mut agent, &ops);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.status(), BatchStatus::PartialFailure);
        assert_eq!(agent.prompt_messages.len(), 2);
        match &agent.prompt_messages[1] {
            PromptMessage::Plain(m) => {
                assert_eq!(m.id, user_id);
                assert_eq!(m.content(), "Scene: {{location}}");
            }
            other => panic!("expected plain message, got {:?}", other),
        }
    }

    #[test]
    fn test_updating_history_through_plain_op_is_type_mismatch() {
        let mut agent = agent_with_three_messages();
        agent.set_history_message(HistoryMessage::new("history"), None);

        let ops = vec![PromptMessageOp {
            message_id: Some("history".into()),
            content: Some("text".into()),
            ..Default::default()
        }];
        let outcome = apply_prompt_message_ops(&mut agent, &ops);
        assert_eq!(outcome.status(), BatchStatus::Failure);
        assert!(outcome.items[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Type mismatch")));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut agent = agent_with_three_messages();
        let op = PromptMessageOp {
            message_id: Some("greeting".into()),
            role: Some(MessageRole::User),
            content: Some("Hello".into()),
            ..Default::default()
        };

        apply_prompt_message_ops(&mut agent, std::slice::from_ref(&op));
        apply_prompt_message_ops(&mut agent, std::slice::from_ref(&op));
        let count = agent
            .prompt_messages
            .iter()
            .filter(|m| m.id() == "greeting")
            .count();
        assert_eq!(count, 1);
        assert_eq!(agent.prompt_messages.len(), 4);
    }

    #[test]
    fn test_normalize_keeps_first_history() {
        let mut messages = vec![
            PromptMessage::History(HistoryMessage::new("h1")),
            PromptMessage::plain(MessageRole::System, "sys"),
            PromptMessage::History(HistoryMessage::new("h2")),
        ];
        normalize_prompt_messages(&mut messages);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id(), "h1");
        assert_eq!(messages[1].role(), Some(MessageRole::User));
    }

    #[test]
    fn test_history_window() {
        let mut history = HistoryMessage::new("h");
        assert_eq!(history.window(5), 0..5);

        history.start = 1;
        history.end = Some(3);
        assert_eq!(history.window(5), 1..3);
        assert_eq!(history.window(2), 1..2);

        history.count_from_end = true;
        // The last three turns, excluding the most recent one.
        assert_eq!(history.window(5), 2..4);

        history.history_type = HistoryType::LastTurn;
        assert_eq!(history.window(5), 3..4);
        assert_eq!(history.window(0), 0..0);
    }

    #[test]
    fn test_message_wire_format() {
        let message = PromptMessage::plain(MessageRole::User, "hi");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["kind"], "plain");
        assert_eq!(json["role"], "user");
        assert_eq!(json["blocks"][0]["template"], "hi");
    }
}
