//! Core conversation types.
//!
//! These types model the data flowing between the agent loop, the tool layer
//! and the AI backends.  They are provider-agnostic; [`super::client`]
//! translates them into each provider's wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::value::ToolParams;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// A tool invocation together with its result.
    Tool,
}

/// Marks assistant messages that did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Normal,
    /// The turn failed; `content` carries the error text.
    Error,
    /// The turn was cancelled; `content` carries the partial reply.
    Interrupted,
}

/// A single entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content of the message.
    #[serde(default)]
    pub content: String,

    /// The directive that was executed (only on [`Role::Tool`] messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,

    /// The outcome of `tool_call` (only on [`Role::Tool`] messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,

    /// When the message was appended.
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_call: None,
            tool_result: None,
            timestamp: Utc::now(),
            status: MessageStatus::Normal,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// Create an assistant message recording a turn-ending failure.
    pub fn assistant_error(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Assistant, content.into());
        msg.status = MessageStatus::Error;
        msg
    }

    /// Create an assistant message holding the partial reply of a cancelled
    /// turn.
    pub fn assistant_interrupted(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Assistant, content.into());
        msg.status = MessageStatus::Interrupted;
        msg
    }

    /// Create a tool message carrying both the directive and its result.
    pub fn tool(call: ToolCall, result: ToolResult) -> Self {
        let content = result.summary();
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call = Some(call);
        msg.tool_result = Some(result);
        msg
    }

    /// Rough token estimate (four characters per token).
    pub fn estimated_tokens(&self) -> usize {
        self.content.chars().count().div_ceil(4)
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation extracted from a model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier generated at extraction time.
    pub id: String,

    /// The name of the tool to invoke.
    pub tool_name: String,

    /// Named arguments.
    #[serde(default)]
    pub parameters: ToolParams,
}

impl ToolCall {
    /// Create a call with a fresh time-ordered id.
    pub fn new(tool_name: impl Into<String>, parameters: ToolParams) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::now_v7().simple()),
            tool_name: tool_name.into(),
            parameters,
        }
    }
}

/// The outcome of executing a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,

    /// Structured payload returned by the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl ToolResult {
    /// A successful result with a payload.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: None,
        }
    }

    /// A failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    /// One-line rendering used as the tool message's `content`.
    pub fn summary(&self) -> String {
        if self.success {
            match &self.data {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => "ok".to_owned(),
            }
        } else {
            format!("error: {}", self.error.as_deref().unwrap_or("unknown error"))
        }
    }
}

// ---------------------------------------------------------------------------
// Replies and usage
// ---------------------------------------------------------------------------

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    /// Total tokens consumed.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// The complete reply to one backend call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    /// Visible content with reasoning removed.
    pub content: String,

    /// Reasoning text reported separately by the provider or split out of
    /// inline `<think>` blocks.
    pub reasoning: Option<String>,

    pub usage: Option<Usage>,
}
