//! Session / Prompt / Content State Machine
//!
//! Tracks which frames are legal at which point in a session's lifetime.
//! Every outbound [`ClientFrame`] goes through [`Session::apply`] and every
//! inbound [`ServerEvent`] through [`Session::observe`] before it takes effect;
//! an illegal transition is reported as a [`ProtocolViolation`] naming the
//! offending frame and the state it arrived in. A rejected frame leaves the
//! state untouched.

use crate::config::{AudioOutputConfig, InferenceConfig, ToolSpec};
use crate::protocol::codec::excerpt;
use crate::protocol::frame::{ClientFrame, ContentKind, GenerationStage, Role, ServerEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Started,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

/// An illegal state transition. Fatal to the session that produced it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Protocol violation: `{frame}` not allowed while {state}: {reason} (frame: {excerpt})")]
pub struct ProtocolViolation {
    pub frame: &'static str,
    pub state: String,
    pub reason: String,
    /// The offending frame as JSON, cut short for large payloads.
    pub excerpt: String,
}

/// One content unit sent by the client within a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentStream {
    pub name: String,
    pub kind: ContentKind,
    pub role: Role,
    pub state: StreamState,
    /// Set for tool result streams only.
    pub tool_use_id: Option<String>,
    pub payload_frames: usize,
}

impl ContentStream {
    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }
}

/// One content unit produced by the remote model within a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputStream {
    pub content_id: String,
    pub kind: ContentKind,
    pub role: Role,
    pub state: StreamState,
    pub generation_stage: Option<GenerationStage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub name: String,
    pub state: Lifecycle,
    pub audio_output: AudioOutputConfig,
    pub tools: Vec<ToolSpec>,
    /// Every stream ever started, closed ones included, so names stay unique.
    streams: HashMap<String, ContentStream>,
    /// Names of the open streams in the order they were opened. At most two.
    open: Vec<String>,
    outputs: HashMap<String, OutputStream>,
}

impl Prompt {
    fn new(name: String, audio_output: AudioOutputConfig, tools: Vec<ToolSpec>) -> Self {
        Self {
            name,
            state: Lifecycle::Started,
            audio_output,
            tools,
            streams: HashMap::new(),
            open: Vec::new(),
            outputs: HashMap::new(),
        }
    }

    pub fn stream(&self, name: &str) -> Option<&ContentStream> {
        self.streams.get(name)
    }

    pub fn open_streams(&self) -> impl Iterator<Item = &ContentStream> {
        self.open.iter().filter_map(|name| self.streams.get(name))
    }

    pub fn output(&self, content_id: &str) -> Option<&OutputStream> {
        self.outputs.get(content_id)
    }

    fn open_stream(&mut self, stream: ContentStream) {
        self.open.push(stream.name.clone());
        self.streams.insert(stream.name.clone(), stream);
    }

    fn open_stream_mut(&mut self, name: &str) -> Result<&mut ContentStream, String> {
        match self.streams.get_mut(name) {
            Some(stream) if stream.is_open() => Ok(stream),
            Some(_) => Err(format!("content '{name}' is already closed")),
            None => Err(format!("content '{name}' was never opened")),
        }
    }

    fn close_stream(&mut self, name: &str) {
        if let Some(stream) = self.streams.get_mut(name) {
            stream.state = StreamState::Closed;
        }
        self.open.retain(|open| open != name);
    }

    fn open_output_mut(&mut self, content_id: &str) -> Result<&mut OutputStream, String> {
        match self.outputs.get_mut(content_id) {
            Some(output) if output.state == StreamState::Open => Ok(output),
            Some(_) => Err(format!("output content '{content_id}' is already closed")),
            None => Err(format!("output content '{content_id}' was never started")),
        }
    }

    fn close_all(&mut self) {
        for name in std::mem::take(&mut self.open) {
            if let Some(stream) = self.streams.get_mut(&name) {
                stream.state = StreamState::Closed;
            }
        }
        for output in self.outputs.values_mut() {
            output.state = StreamState::Closed;
        }
    }
}

/// One end-to-end connection lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: String,
    state: Lifecycle,
    inference: Option<InferenceConfig>,
    prompts: Vec<Prompt>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Lifecycle::Created,
            inference: None,
            prompts: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn inference(&self) -> Option<&InferenceConfig> {
        self.inference.as_ref()
    }

    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.name == name)
    }

    /// The prompt currently accepting content, if any.
    pub fn active_prompt(&self) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.state == Lifecycle::Started)
    }

    /// Validates an outbound frame and applies its transition.
    pub fn apply(&mut self, frame: &ClientFrame) -> Result<(), ProtocolViolation> {
        let outcome = self.try_apply(frame);
        outcome.map_err(|reason| self.violation(frame.kind(), frame, reason))
    }

    /// Validates an inbound event and applies its transition.
    pub fn observe(&mut self, event: &ServerEvent) -> Result<(), ProtocolViolation> {
        let outcome = self.try_observe(event);
        outcome.map_err(|reason| self.violation(event.kind(), event, reason))
    }

    /// Forces the session into `Ended`, closing every prompt and stream.
    ///
    /// Used when the transport goes away or the session is torn down after a
    /// violation; no frames are involved.
    pub fn terminate(&mut self) {
        for prompt in &mut self.prompts {
            prompt.close_all();
            if prompt.state == Lifecycle::Started {
                prompt.state = Lifecycle::Ended;
            }
        }
        self.state = Lifecycle::Ended;
    }

    /// Human readable summary of the current state, used in violations and logs.
    pub fn describe(&self) -> String {
        let mut out = format!("session {:?}", self.state);
        if let Some(prompt) = self.prompts.last() {
            let _ = write!(out, ", prompt '{}' {:?}", prompt.name, prompt.state);
            let open: Vec<String> = prompt
                .open_streams()
                .map(|s| format!("{} ({:?})", s.name, s.kind))
                .collect();
            if !open.is_empty() {
                let _ = write!(out, ", open content [{}]", open.join(", "));
            }
        }
        out
    }

    fn violation(
        &self,
        frame: &'static str,
        offending: &impl Serialize,
        reason: String,
    ) -> ProtocolViolation {
        ProtocolViolation {
            frame,
            state: self.describe(),
            reason,
            excerpt: serde_json::to_string(offending)
                .map(|json| excerpt(&json))
                .unwrap_or_default(),
        }
    }

    fn require_started(&self) -> Result<(), String> {
        match self.state {
            Lifecycle::Started => Ok(()),
            Lifecycle::Created => Err("session has not started".to_string()),
            Lifecycle::Ended => Err("session has ended".to_string()),
        }
    }

    fn started_prompt_mut(&mut self, name: &str) -> Result<&mut Prompt, String> {
        self.require_started()?;
        match self.prompts.iter_mut().find(|p| p.name == name) {
            Some(prompt) if prompt.state == Lifecycle::Started => Ok(prompt),
            Some(prompt) => Err(format!("prompt '{name}' is {:?}", prompt.state)),
            None => Err(format!("prompt '{name}' was never started")),
        }
    }

    fn known_prompt(&self, name: &str) -> Result<&Prompt, String> {
        self.require_started()?;
        self.prompt(name)
            .ok_or_else(|| format!("prompt '{name}' was never started"))
    }

    fn try_apply(&mut self, frame: &ClientFrame) -> Result<(), String> {
        match frame {
            ClientFrame::SessionStart(start) => {
                if self.state != Lifecycle::Created {
                    return Err("session was already started".to_string());
                }
                self.inference = Some(start.inference_configuration);
                self.state = Lifecycle::Started;
            }
            ClientFrame::SessionEnd(_) => {
                self.require_started()?;
                if let Some(prompt) = self.active_prompt() {
                    return Err(format!("prompt '{}' must end first", prompt.name));
                }
                self.state = Lifecycle::Ended;
            }
            ClientFrame::PromptStart(start) => {
                self.require_started()?;
                if let Some(prompt) = self.active_prompt() {
                    return Err(format!("prompt '{}' is still active", prompt.name));
                }
                if self.prompt(&start.prompt_name).is_some() {
                    return Err(format!(
                        "prompt name '{}' was already used in this session",
                        start.prompt_name
                    ));
                }
                self.prompts.push(Prompt::new(
                    start.prompt_name.clone(),
                    start.audio_output_configuration.clone(),
                    start
                        .tool_configuration
                        .tools
                        .iter()
                        .map(|entry| entry.tool_spec.clone())
                        .collect(),
                ));
            }
            ClientFrame::PromptEnd(end) => {
                let prompt = self.started_prompt_mut(&end.prompt_name)?;
                if let Some(open) = prompt.open_streams().next() {
                    return Err(format!("content '{}' must be closed first", open.name));
                }
                // Unfinished model output is abandoned with its prompt.
                prompt.close_all();
                prompt.state = Lifecycle::Ended;
            }
            ClientFrame::ContentStart(start) => {
                let prompt = self.started_prompt_mut(&start.prompt_name)?;
                if let Some(existing) = prompt.stream(&start.content_name) {
                    return Err(if existing.is_open() {
                        format!("content '{}' is already open", start.content_name)
                    } else {
                        format!("content name '{}' was already used", start.content_name)
                    });
                }
                let kind = start.config.kind();
                // Live audio may overlap one discrete text or tool turn, nothing more.
                let is_audio = kind == ContentKind::Audio;
                if let Some(open) = prompt
                    .open_streams()
                    .find(|s| (s.kind == ContentKind::Audio) == is_audio)
                {
                    return Err(format!(
                        "content '{}' ({:?}) is still open",
                        open.name, open.kind
                    ));
                }
                prompt.open_stream(ContentStream {
                    name: start.content_name.clone(),
                    kind,
                    role: start.role,
                    state: StreamState::Open,
                    tool_use_id: start.config.tool_use_id().map(str::to_string),
                    payload_frames: 0,
                });
            }
            ClientFrame::TextInput(payload) => {
                self.append(&payload.prompt_name, &payload.content_name, ContentKind::Text)?;
            }
            ClientFrame::AudioInput(payload) => {
                self.append(&payload.prompt_name, &payload.content_name, ContentKind::Audio)?;
            }
            ClientFrame::ToolResult(payload) => {
                self.append(&payload.prompt_name, &payload.content_name, ContentKind::Tool)?;
            }
            ClientFrame::ContentEnd(end) => {
                let prompt = self.started_prompt_mut(&end.prompt_name)?;
                let stream = prompt.open_stream_mut(&end.content_name)?;
                if stream.kind == ContentKind::Tool && stream.payload_frames != 1 {
                    return Err(format!(
                        "tool content '{}' must carry exactly one result before closing",
                        end.content_name
                    ));
                }
                prompt.close_stream(&end.content_name);
            }
        }
        Ok(())
    }

    fn append(&mut self, prompt_name: &str, content_name: &str, kind: ContentKind) -> Result<(), String> {
        let prompt = self.started_prompt_mut(prompt_name)?;
        let stream = prompt.open_stream_mut(content_name)?;
        if stream.kind != kind {
            return Err(format!(
                "content '{content_name}' is {:?}, not {:?}",
                stream.kind, kind
            ));
        }
        if kind == ContentKind::Tool && stream.payload_frames > 0 {
            return Err(format!(
                "tool content '{content_name}' already carries its result"
            ));
        }
        stream.payload_frames += 1;
        Ok(())
    }

    fn try_observe(&mut self, event: &ServerEvent) -> Result<(), String> {
        match event {
            ServerEvent::CompletionStart(start) => {
                self.known_prompt(&start.prompt_name)?;
            }
            ServerEvent::CompletionEnd(end) => {
                self.known_prompt(&end.prompt_name)?;
            }
            ServerEvent::UsageEvent(_) => self.require_started()?,
            ServerEvent::ContentStart(start) => {
                let prompt = self.started_prompt_mut(&start.prompt_name)?;
                if prompt.output(&start.content_id).is_some() {
                    return Err(format!(
                        "output content '{}' was already started",
                        start.content_id
                    ));
                }
                prompt.outputs.insert(start.content_id.clone(), OutputStream {
                    content_id: start.content_id.clone(),
                    kind: start.kind,
                    role: start.role,
                    state: StreamState::Open,
                    generation_stage: start.generation_stage(),
                });
            }
            ServerEvent::TextOutput(out) => {
                self.expect_output(&out.prompt_name, &out.content_id, ContentKind::Text)?;
            }
            ServerEvent::AudioOutput(out) => {
                self.expect_output(&out.prompt_name, &out.content_id, ContentKind::Audio)?;
            }
            ServerEvent::ToolUse(tool_use) => {
                self.expect_output(&tool_use.prompt_name, &tool_use.content_id, ContentKind::Tool)?;
            }
            ServerEvent::ContentEnd(end) => {
                let prompt = self.started_prompt_mut(&end.prompt_name)?;
                prompt.open_output_mut(&end.content_id)?.state = StreamState::Closed;
            }
        }
        Ok(())
    }

    fn expect_output(&mut self, prompt_name: &str, content_id: &str, kind: ContentKind) -> Result<(), String> {
        let prompt = self.started_prompt_mut(prompt_name)?;
        let output = prompt.open_output_mut(content_id)?;
        if output.kind != kind {
            return Err(format!(
                "output content '{content_id}' is {:?}, not {:?}",
                output.kind, kind
            ));
        }
        Ok(())
    }
}
