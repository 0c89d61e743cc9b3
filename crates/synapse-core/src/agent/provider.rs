//! Completion Provider contract.
//!
//! The provider is an external collaborator: one call per completion round,
//! bounded by the executor's own timeout regardless of provider-side limits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::tools::ToolDescriptor;
use crate::domain::Usage;

/// Who authored a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
    /// Set on `Tool` messages: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(PromptRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(PromptRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(PromptRole::Assistant, content)
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Self::new(PromptRole::Tool, content)
        }
    }

    fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            call_id: None,
        }
    }
}

/// Everything the provider sees for one completion round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub messages: Vec<PromptMessage>,
    /// Tools the model may call this round.
    pub tools: Vec<ToolDescriptor>,
}

impl PromptContext {
    pub fn push(&mut self, message: PromptMessage) {
        self.messages.push(message);
    }

    /// Character count over all messages; used for diagnostics only.
    pub fn chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_id: String,
    pub input: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

impl Completion {
    pub fn text(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage,
        }
    }

    pub fn with_tool_call(
        mut self,
        call_id: impl Into<String>,
        tool_id: impl Into<String>,
        input: Value,
    ) -> Self {
        self.tool_calls.push(ToolCallRequest {
            call_id: call_id.into(),
            tool_id: tool_id.into(),
            input,
        });
        self
    }
}

/// Provider failure taxonomy.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider throttled the request: {0}")]
    Throttled(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("provider returned a malformed completion: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Unavailable(_))
    }
}

/// Contract for the LLM completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        prompt: &PromptContext,
        params: &ModelParameters,
    ) -> Result<Completion, ProviderError>;
}
