//! Defines the WebSocket message protocol between the browser client and the API server.
//!
//! Microphone audio travels as binary frames in one direction and synthesized
//! speech as binary frames in the other; everything else is a JSON text frame
//! described here.

use s2s_core::protocol::{GenerationStage, Role};
use s2s_core::{EndReason, SessionEvent};
use serde::{Deserialize, Serialize};

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the session. This must be the first message.
    Init {
        /// Overrides the configured voice for this session.
        #[serde(default)]
        voice_id: Option<String>,
        /// Overrides the configured system prompt for this session.
        #[serde(default)]
        system_prompt: Option<String>,
    },
    /// A typed user turn, sent alongside or instead of speech.
    UserText { text: String },
    /// The user stopped talking; closes the current audio stream.
    EndAudio,
    /// Ends the conversation gracefully.
    EndTurn,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the session is running upstream.
    Initialized {
        session_id: String,
        prompt_name: String,
        tools: Vec<String>,
    },
    /// A transcript fragment of either side of the conversation.
    TextOutput {
        role: Role,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        generation_stage: Option<GenerationStage>,
    },
    /// Progress of a tool call the model made.
    ToolActivity {
        tool_use_id: String,
        tool_name: String,
        status: ToolStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// The user barged in; the client should flush queued playback.
    Interrupted,
    /// Reports an error to the client.
    Error { message: String },
    /// The session is over.
    Ended { reason: String },
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Requested,
    Completed,
    Failed,
}

impl ServerMessage {
    /// Maps a session event onto the browser protocol.
    ///
    /// Audio is not covered here since it goes out as a binary frame, and
    /// bookkeeping events the browser has no use for map to `None`.
    pub fn from_event(event: &SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::TextOutput {
                role,
                text,
                generation_stage,
                ..
            } => Some(Self::TextOutput {
                role: *role,
                text: text.clone(),
                generation_stage: *generation_stage,
            }),
            SessionEvent::ToolRequested {
                tool_use_id,
                tool_name,
                input,
            } => Some(Self::ToolActivity {
                tool_use_id: tool_use_id.clone(),
                tool_name: tool_name.clone(),
                status: ToolStatus::Requested,
                detail: Some(input.to_string()),
            }),
            SessionEvent::ToolCompleted {
                tool_use_id,
                tool_name,
            } => Some(Self::ToolActivity {
                tool_use_id: tool_use_id.clone(),
                tool_name: tool_name.clone(),
                status: ToolStatus::Completed,
                detail: None,
            }),
            SessionEvent::ToolFailed {
                tool_use_id,
                tool_name,
                error,
            } => Some(Self::ToolActivity {
                tool_use_id: tool_use_id.clone(),
                tool_name: tool_name.clone(),
                status: ToolStatus::Failed,
                detail: Some(error.clone()),
            }),
            SessionEvent::Interrupted => Some(Self::Interrupted),
            SessionEvent::Ended(reason) => Some(Self::Ended {
                reason: describe_end(reason),
            }),
            SessionEvent::AudioOutput(_)
            | SessionEvent::CompletionEnded { .. }
            | SessionEvent::Usage(_) => None,
        }
    }
}

fn describe_end(reason: &EndReason) -> String {
    match reason {
        EndReason::Closed => "closed".to_string(),
        EndReason::TransportClosed => "transport_closed".to_string(),
        EndReason::ProtocolViolation(detail) => format!("protocol_violation: {}", detail),
    }
}
