use crate::protocol::{GenerationStage, Role};
use bytes::Bytes;
use serde_json::Value;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// The local caller closed the session or ended the turn.
    Closed,
    /// The transport went away underneath the session.
    TransportClosed,
    /// The session hit an illegal state transition.
    ProtocolViolation(String),
}

/// Events the orchestrator reports back to its caller.
///
/// These decouple protocol handling from whatever plays audio or renders
/// transcripts; a caller only needs to drain the event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A transcript fragment of the user's speech or the model's reply.
    TextOutput {
        role: Role,
        text: String,
        generation_stage: Option<GenerationStage>,
        /// Set when the remote service marks the fragment as the end of a response.
        stop_reason: Option<String>,
    },
    /// A chunk of synthesized speech.
    AudioOutput(Bytes),
    /// The model asked for a tool to run.
    ToolRequested {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    /// A tool result was reported back to the model.
    ToolCompleted { tool_use_id: String, tool_name: String },
    /// A tool failed; its failure text was reported back to the model.
    ToolFailed {
        tool_use_id: String,
        tool_name: String,
        error: String,
    },
    /// The user barged in and the model stopped speaking.
    Interrupted,
    /// The model finished its response.
    CompletionEnded { stop_reason: Option<String> },
    /// Token accounting from the remote service, passed through as-is.
    Usage(Value),
    /// The session is over; no further events follow.
    Ended(EndReason),
}
