//! Tool catalogue and dispatch.
//!
//! Tools are a closed set of kinds, each served by one [`ToolExecutor`]
//! implementation. The dispatcher resolves a tool id through the catalogue,
//! applies the activation and auth checks, then hands the call to the
//! executor registered for the tool's kind. Calls are never retried here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// How a tool is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Serverless function invocation.
    Lambda,
    /// REST endpoint.
    Http,
    /// Sandboxed code or query execution.
    Code,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lambda => "lambda",
            Self::Http => "http",
            Self::Code => "code",
        };
        f.write_str(s)
    }
}

/// Catalogue entry for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub description: String,
    pub kind: ToolKind,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ToolDescriptor {
    pub fn new(id: impl Into<String>, kind: ToolKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind,
            requires_auth: false,
            active: true,
        }
    }

    pub fn requiring_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Successful tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: Value,
    /// Cost charged by the tool itself, if any.
    #[serde(default)]
    pub cost_usd: f64,
}

impl ToolOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            cost_usd: 0.0,
        }
    }
}

/// Tool failure taxonomy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolExecutionError {
    #[error("unknown tool: {tool_id}")]
    UnknownTool { tool_id: String },

    #[error("duplicate tool registration: {tool_id}")]
    DuplicateTool { tool_id: String },

    #[error("tool '{tool_id}' is inactive")]
    Inactive { tool_id: String },

    #[error("tool '{tool_id}' requires an auth token")]
    Unauthorized { tool_id: String },

    #[error("no executor registered for {kind} tools")]
    NoExecutor { kind: ToolKind },

    #[error("tool '{tool_id}' failed: {message}")]
    Failed { tool_id: String, message: String },
}

/// Contract for one kind of tool backend.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(
        &self,
        tool: &ToolDescriptor,
        input: &Value,
        auth_token: Option<&str>,
    ) -> Result<ToolOutput, ToolExecutionError>;
}

/// Catalogue plus one executor slot per [`ToolKind`].
#[derive(Default)]
pub struct ToolDispatcher {
    catalog: HashMap<String, ToolDescriptor>,
    lambda: Option<Arc<dyn ToolExecutor>>,
    http: Option<Arc<dyn ToolExecutor>>,
    code: Option<Arc<dyn ToolExecutor>>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDescriptor) -> Result<(), ToolExecutionError> {
        if self.catalog.contains_key(&tool.id) {
            return Err(ToolExecutionError::DuplicateTool { tool_id: tool.id });
        }
        self.catalog.insert(tool.id.clone(), tool);
        Ok(())
    }

    pub fn with_executor(mut self, kind: ToolKind, executor: Arc<dyn ToolExecutor>) -> Self {
        *self.slot(kind) = Some(executor);
        self
    }

    pub fn descriptor(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.catalog.get(tool_id)
    }

    /// Active descriptors among `tool_ids`, in the given order.
    pub fn available(&self, tool_ids: &[String]) -> Vec<ToolDescriptor> {
        tool_ids
            .iter()
            .filter_map(|id| self.catalog.get(id))
            .filter(|t| t.active)
            .cloned()
            .collect()
    }

    /// Resolve and invoke `tool_id` exactly once.
    pub async fn invoke(
        &self,
        tool_id: &str,
        input: &Value,
        auth_token: Option<&str>,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let tool = self
            .catalog
            .get(tool_id)
            .ok_or_else(|| ToolExecutionError::UnknownTool {
                tool_id: tool_id.to_string(),
            })?;
        if !tool.active {
            return Err(ToolExecutionError::Inactive {
                tool_id: tool.id.clone(),
            });
        }
        if tool.requires_auth && auth_token.is_none() {
            return Err(ToolExecutionError::Unauthorized {
                tool_id: tool.id.clone(),
            });
        }

        let executor = match tool.kind {
            ToolKind::Lambda => self.lambda.as_ref(),
            ToolKind::Http => self.http.as_ref(),
            ToolKind::Code => self.code.as_ref(),
        }
        .ok_or(ToolExecutionError::NoExecutor { kind: tool.kind })?;

        debug!(tool_id, kind = %tool.kind, "invoking tool");
        executor.invoke(tool, input, auth_token).await
    }

    fn slot(&mut self, kind: ToolKind) -> &mut Option<Arc<dyn ToolExecutor>> {
        match kind {
            ToolKind::Lambda => &mut self.lambda,
            ToolKind::Http => &mut self.http,
            ToolKind::Code => &mut self.code,
        }
    }
}

impl fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tools: Vec<&String> = self.catalog.keys().collect();
        tools.sort();
        f.debug_struct("ToolDispatcher")
            .field("tools", &tools)
            .field("lambda", &self.lambda.is_some())
            .field("http", &self.http.is_some())
            .field("code", &self.code.is_some())
            .finish()
    }
}
