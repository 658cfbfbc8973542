//! The client-side conversation model: an ordered list of messages where
//! assistant content is an ordered sequence of text, thought and
//! tool-call parts.
//!
//! Tool calls are owned by the `content` sequence alone; the by-id lookup
//! is an index into that sequence, never a second owner. The flat `text`
//! and `thought` accumulators are maintained alongside `content` for
//! backward-compatible consumers.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Text,
    Thought,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Thought { thought: String },
    ToolCall { call: ToolCall },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ToolStatus {
    /// Map a wire status string; `in_progress` arrives from some agents
    /// where others say `running`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "queued" | "pending" => ToolStatus::Queued,
            "in_progress" | "running" => ToolStatus::Running,
            "completed" => ToolStatus::Completed,
            "failed" | "error" => ToolStatus::Failed,
            "cancelled" | "canceled" => ToolStatus::Cancelled,
            _ => ToolStatus::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolStatus::Completed | ToolStatus::Failed | ToolStatus::Cancelled
        )
    }
}

/// Normalized diff attached to a tool call, whatever wire shape it
/// arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub unified: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_text_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_text_length: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub title: String,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,
    pub timestamp: i64,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: String,
    pub text: String,
    pub hidden: bool,
    pub timestamp: i64,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub id: String,
    pub content: Vec<ContentPart>,
    /// Flat accumulator over all text parts.
    pub text: String,
    /// Flat accumulator over all thought parts.
    pub thought: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub hidden: bool,
    pub timestamp: i64,
    pub seq: u64,
    /// By-id index into `content`; rebuilt never, appended always.
    #[serde(skip)]
    pub tool_index: HashMap<String, usize>,
    #[serde(skip)]
    pub final_emitted: bool,
}

impl AssistantMessage {
    pub fn new(id: String, hidden: bool, timestamp: i64, seq: u64) -> Self {
        Self {
            id,
            content: Vec::new(),
            text: String::new(),
            thought: String::new(),
            stop_reason: None,
            hidden,
            timestamp,
            seq,
            tool_index: HashMap::new(),
            final_emitted: false,
        }
    }

    /// The current part of the given kind: the last part of `content`
    /// only if it matches. A tool call (or a part of the other kind) in
    /// last position means a fresh part must be opened.
    pub fn current_part_mut(&mut self, kind: PartKind) -> Option<&mut String> {
        match (kind, self.content.last_mut()) {
            (PartKind::Text, Some(ContentPart::Text { text })) => Some(text),
            (PartKind::Thought, Some(ContentPart::Thought { thought })) => Some(thought),
            _ => None,
        }
    }

    pub fn open_part(&mut self, kind: PartKind) -> &mut String {
        let part = match kind {
            PartKind::Text => ContentPart::Text {
                text: String::new(),
            },
            PartKind::Thought => ContentPart::Thought {
                thought: String::new(),
            },
        };
        self.content.push(part);
        match (kind, self.content.last_mut()) {
            (PartKind::Text, Some(ContentPart::Text { text })) => text,
            (PartKind::Thought, Some(ContentPart::Thought { thought })) => thought,
            _ => unreachable!("just pushed part of requested kind"),
        }
    }

    pub fn accumulator_mut(&mut self, kind: PartKind) -> &mut String {
        match kind {
            PartKind::Text => &mut self.text,
            PartKind::Thought => &mut self.thought,
        }
    }

    pub fn push_tool_call(&mut self, call: ToolCall) {
        let index = self.content.len();
        self.tool_index.insert(call.id.clone(), index);
        self.content.push(ContentPart::ToolCall { call });
    }

    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        match self.tool_index.get(id).and_then(|i| self.content.get(*i)) {
            Some(ContentPart::ToolCall { call }) => Some(call),
            _ => None,
        }
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
        let index = *self.tool_index.get(id)?;
        match self.content.get_mut(index) {
            Some(ContentPart::ToolCall { call }) => Some(call),
            _ => None,
        }
    }

    /// Tool calls in content order, for consumers of the flat view.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall { call } => Some(call),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User(UserMessage),
    Assistant(AssistantMessage),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn last_assistant_mut(&mut self) -> Option<&mut AssistantMessage> {
        match self.messages.last_mut() {
            Some(ChatMessage::Assistant(message)) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub kind: String,
    pub label: String,
}

/// A tool-invocation authorization request awaiting the client's
/// selected outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub request_id: Value,
    pub tool_call: ToolCall,
    pub options: Vec<PermissionOption>,
}
