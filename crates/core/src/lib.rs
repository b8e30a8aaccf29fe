//! Protocol core for realtime speech-to-speech sessions.
//!
//! A session with the remote model service is a strictly ordered exchange of
//! JSON event frames. This crate types those frames ([`protocol`]), enforces
//! their ordering ([`state`]), tracks tool calls ([`correlator`]) and drives
//! the whole exchange for one session ([`orchestrator`]).

pub mod builtin_tools;
pub mod config;
pub mod correlator;
pub mod events;
pub mod orchestrator;
pub mod protocol;
pub mod state;
pub mod tools;

pub use config::{SessionConfig, ToolSpec};
pub use events::{EndReason, SessionEvent};
pub use orchestrator::{Outbound, SessionChannels, SessionError, SessionOrchestrator};
pub use state::{Lifecycle, ProtocolViolation};
pub use tools::{McpToolExecutor, ToolError, ToolExecutor};
