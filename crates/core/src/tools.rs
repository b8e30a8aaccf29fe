//! Tool execution seam.
//!
//! The orchestrator runs tools through the narrow [`ToolExecutor`] contract:
//! a tool name plus JSON input in, a JSON result or a [`ToolError`] out.
//! [`McpToolExecutor`] implements it on top of an MCP client connection.

use crate::config::ToolSpec;
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool use id '{0}' is already pending")]
    DuplicateToolUseId(String),
    #[error("Tool use id '{0}' is not pending")]
    UnknownToolUseId(String),
    #[error("Tool '{0}' is not configured for this prompt")]
    UnknownTool(String),
    #[error("Invalid input for tool '{tool}': {message}")]
    InvalidInput { tool: String, message: String },
    #[error("Tool '{tool}' failed: {message}")]
    ExecutionFailure { tool: String, message: String },
    #[error("Tool '{tool}' timed out after {after:?}")]
    Timeout { tool: String, after: Duration },
}

impl ToolError {
    /// Textual payload sent back to the model in place of a tool result.
    pub fn to_payload(&self) -> String {
        serde_json::json!({
            "status": "error",
            "message": self.to_string(),
        })
        .to_string()
    }
}

/// Runs a named tool against a JSON input.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, input: Value) -> Result<Value, ToolError>;
}

/// Executes tools through a running MCP client.
pub struct McpToolExecutor {
    client: RunningService<RoleClient, ()>,
}

impl McpToolExecutor {
    pub fn new(client: RunningService<RoleClient, ()>) -> Self {
        Self { client }
    }

    /// Lists the server's tools as specs to advertise in a prompt.
    pub async fn tool_specs(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let tools = self
            .client
            .list_all_tools()
            .await
            .map_err(|e| ToolError::ExecutionFailure {
                tool: "tools/list".to_string(),
                message: e.to_string(),
            })?;

        Ok(tools
            .into_iter()
            .map(|t| {
                ToolSpec::new(
                    t.name.to_string(),
                    t.description.map(|d| d.to_string()).unwrap_or_default(),
                    Value::Object((*t.input_schema).clone()),
                )
            })
            .collect())
    }
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    async fn execute(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let arguments = match input {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(ToolError::InvalidInput {
                    tool: name.to_string(),
                    message: format!("expected a JSON object, got {other}"),
                });
            }
        };

        debug!(tool = %name, "Calling MCP tool");
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .map_err(|e| ToolError::ExecutionFailure {
                tool: name.to_string(),
                message: e.to_string(),
            })?;

        let text = result
            .content
            .unwrap_or_default()
            .into_iter()
            .filter_map(|content| match content.raw {
                RawContent::Text(text_content) => Some(text_content.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error == Some(true) {
            warn!(tool = %name, error = %text, "MCP tool reported an error");
            return Err(ToolError::ExecutionFailure {
                tool: name.to_string(),
                message: text,
            });
        }

        // Tools answer with JSON where they can; anything else is passed as text.
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
