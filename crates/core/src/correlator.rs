//! Tool Dispatch Correlator
//!
//! Bookkeeping for tool invocations requested by the remote model. The
//! correlator never runs a tool; it only remembers which tool-use ids are
//! waiting for a result and builds the frames that report a result back.

use crate::protocol::frame::{ClientFrame, ToolUse};
use crate::tools::ToolError;
use serde_json::Value;
use std::collections::HashMap;

/// A pending request from the remote model to run a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    pub prompt_name: String,
}

impl From<&ToolUse> for ToolInvocation {
    fn from(tool_use: &ToolUse) -> Self {
        Self {
            tool_use_id: tool_use.tool_use_id.clone(),
            tool_name: tool_use.tool_name.clone(),
            input: tool_use.content.clone(),
            prompt_name: tool_use.prompt_name.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ToolCorrelator {
    pending: HashMap<String, ToolInvocation>,
}

impl ToolCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new invocation. The same id may not be pending twice.
    pub fn register(&mut self, invocation: ToolInvocation) -> Result<(), ToolError> {
        if self.pending.contains_key(&invocation.tool_use_id) {
            return Err(ToolError::DuplicateToolUseId(invocation.tool_use_id));
        }
        self.pending
            .insert(invocation.tool_use_id.clone(), invocation);
        Ok(())
    }

    /// Removes a pending invocation and returns the frame triple reporting
    /// `payload` as its result over the invocation's prompt.
    pub fn resolve(
        &mut self,
        tool_use_id: &str,
        content_name: &str,
        payload: impl Into<String>,
    ) -> Result<(ToolInvocation, [ClientFrame; 3]), ToolError> {
        let invocation = self
            .pending
            .remove(tool_use_id)
            .ok_or_else(|| ToolError::UnknownToolUseId(tool_use_id.to_string()))?;

        let prompt = invocation.prompt_name.as_str();
        let frames = [
            ClientFrame::tool_content_start(prompt, content_name, tool_use_id),
            ClientFrame::tool_result(prompt, content_name, payload),
            ClientFrame::content_end(prompt, content_name),
        ];
        Ok((invocation, frames))
    }

    pub fn get(&self, tool_use_id: &str) -> Option<&ToolInvocation> {
        self.pending.get(tool_use_id)
    }

    /// Pending ids in sorted order.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forgets every pending invocation, returning them.
    pub fn cancel_all(&mut self) -> Vec<ToolInvocation> {
        self.pending.drain().map(|(_, invocation)| invocation).collect()
    }
}
