//! Session Orchestrator
//!
//! Drives one session end to end. Local operations (`start`, audio, text,
//! `end_turn`, `close`) and inbound events from the remote service all funnel
//! through a single mutex-guarded emission path: each outbound frame is
//! validated against the state machine, encoded and queued while the lock is
//! held, so frames leave in exactly the order they were accepted.
//!
//! Tool invocations never run on that path. Each one is spawned as its own
//! task under the configured deadline, and only the final result re-enters
//! the emission path to be reported through the correlator.

use crate::config::{ConfigError, InferenceConfig, SessionConfig};
use crate::correlator::{ToolCorrelator, ToolInvocation};
use crate::events::{EndReason, SessionEvent};
use crate::protocol::frame::ToolUse;
use crate::protocol::{
    ClientFrame, CodecError, ContentKind, Role, ServerEvent, decode_server_event, encode,
};
use crate::state::{Lifecycle, ProtocolViolation, Session};
use crate::tools::{ToolError, ToolExecutor};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Session has not been started")]
    NotStarted,
    #[error("Session was already started")]
    AlreadyStarted,
    #[error("Session has ended")]
    SessionEnded,
    /// Nothing is left to carry frames; the session was ended.
    #[error("Transport is closed; `{frame}` could not be sent")]
    TransportClosed { frame: &'static str },
}

/// What the transport should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// An encoded frame to send as-is.
    Frame(String),
    /// Close the connection; nothing follows.
    Close,
}

/// Receiving ends handed to whoever owns the transport and the UI.
pub struct SessionChannels {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

struct Shared {
    session: Session,
    correlator: ToolCorrelator,
    prompt_name: Option<String>,
    audio_content: Option<String>,
    tool_tasks: HashMap<String, AbortHandle>,
}

struct Inner {
    session_id: String,
    config: SessionConfig,
    executor: Arc<dyn ToolExecutor>,
    shared: Mutex<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// A cloneable handle to one session. Clones share the same session.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(
        config: SessionConfig,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<(Self, SessionChannels), ConfigError> {
        config.validate()?;

        let session_id = Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            session_id: session_id.clone(),
            config,
            executor,
            shared: Mutex::new(Shared {
                session: Session::new(session_id),
                correlator: ToolCorrelator::new(),
                prompt_name: None,
                audio_content: None,
                tool_tasks: HashMap::new(),
            }),
            outbound: outbound_tx,
            events: events_tx,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            SessionChannels {
                outbound: outbound_rx,
                events: events_rx,
            },
        ))
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> Lifecycle {
        self.inner.shared.lock().await.session.state()
    }

    /// A copy of the full state machine, for inspection.
    pub async fn snapshot(&self) -> Session {
        self.inner.shared.lock().await.session.clone()
    }

    pub async fn prompt_name(&self) -> Option<String> {
        self.inner.shared.lock().await.prompt_name.clone()
    }

    pub async fn pending_tool_ids(&self) -> Vec<String> {
        self.inner.shared.lock().await.correlator.pending_ids()
    }

    // --- Local Operations ---

    /// Starts the session with the configured inference parameters and system prompt.
    pub async fn start_with_defaults(&self) -> Result<String, SessionError> {
        let inference = self.inner.config.inference;
        let system_prompt = self.inner.config.system_prompt.clone();
        self.start(inference, &system_prompt).await
    }

    /// Opens the session and its prompt, sends the system prompt and any
    /// priming history, and returns the generated prompt name.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn start(
        &self,
        inference: InferenceConfig,
        system_prompt: &str,
    ) -> Result<String, SessionError> {
        inference.validate()?;
        let mut shared = self.inner.shared.lock().await;
        match shared.session.state() {
            Lifecycle::Created => {}
            Lifecycle::Started => return Err(SessionError::AlreadyStarted),
            Lifecycle::Ended => return Err(SessionError::SessionEnded),
        }

        let config = &self.inner.config;
        let prompt_name = Uuid::new_v4().to_string();
        let mut frames = vec![
            ClientFrame::session_start(inference),
            ClientFrame::prompt_start(&prompt_name, config.audio_output.clone(), &config.tools),
        ];
        frames.extend(text_turn(&prompt_name, Role::System, system_prompt, false));
        for turn in &config.history {
            frames.extend(text_turn(&prompt_name, turn.role, &turn.text, false));
        }

        self.emit_all(&mut shared, frames)?;
        shared.prompt_name = Some(prompt_name.clone());
        info!(
            prompt_name = %prompt_name,
            tools = config.tools.len(),
            history = config.history.len(),
            "Session started"
        );
        Ok(prompt_name)
    }

    /// Streams one microphone chunk, opening the audio content on first use.
    pub async fn send_audio_chunk(&self, chunk: Bytes) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        let prompt_name = ready(&shared)?;

        let content_name = match shared.audio_content.clone() {
            Some(name) => name,
            None => {
                let name = Uuid::new_v4().to_string();
                let audio_input = self.inner.config.audio_input.clone();
                self.emit(
                    &mut shared,
                    ClientFrame::audio_content_start(&prompt_name, &name, audio_input),
                )?;
                debug!(content_name = %name, "Audio input opened");
                shared.audio_content = Some(name.clone());
                name
            }
        };

        self.emit(
            &mut shared,
            ClientFrame::audio_input(&prompt_name, &content_name, chunk),
        )
    }

    /// Closes the open audio content, if any, while keeping the prompt alive.
    pub async fn end_audio_input(&self) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        let prompt_name = ready(&shared)?;
        if let Some(content_name) = shared.audio_content.take() {
            self.emit(
                &mut shared,
                ClientFrame::content_end(&prompt_name, &content_name),
            )?;
            debug!(content_name = %content_name, "Audio input closed");
        }
        Ok(())
    }

    /// Sends one complete user text turn.
    pub async fn send_user_text(&self, text: &str) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        let prompt_name = ready(&shared)?;
        self.emit_all(&mut shared, text_turn(&prompt_name, Role::User, text, true))
    }

    /// Ends the conversation gracefully: open content is closed (audio first),
    /// then the prompt, then the session. The transport is left to the caller.
    /// Calling it on an ended session does nothing; calling it before `start`
    /// is rejected and leaves the session startable.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn end_turn(&self) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.state() == Lifecycle::Created {
            return Err(SessionError::NotStarted);
        }
        self.shutdown(&mut shared)
    }

    /// Like [`Self::end_turn`], then asks the transport to close. Idempotent.
    /// Before `start` this only closes the transport; the session is over either way.
    #[instrument(skip_all, fields(session_id = %self.inner.session_id))]
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.state() == Lifecycle::Ended {
            debug!("Close on an ended session ignored");
            return Ok(());
        }
        let result = self.shutdown(&mut shared);
        // A violation during shutdown has already closed the transport.
        if !matches!(result, Err(SessionError::Protocol(_))) {
            let _ = self.inner.outbound.send(Outbound::Close);
        }
        result
    }

    /// The transport went away. Ends the session without sending anything.
    pub async fn transport_closed(&self) {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.state() == Lifecycle::Ended {
            return;
        }
        warn!(session_id = %self.inner.session_id, "Transport closed under an active session");
        self.abandon(&mut shared);
    }

    /// Reports a result for a pending tool invocation on the caller's behalf.
    /// A dispatch still running for the same id is cancelled.
    pub async fn submit_tool_result(
        &self,
        tool_use_id: &str,
        result: Value,
    ) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        ready(&shared)?;
        if let Some(task) = shared.tool_tasks.remove(tool_use_id) {
            task.abort();
        }
        self.deliver(&mut shared, tool_use_id, Ok(result))
    }

    // --- Inbound ---

    /// Decodes and handles one frame received from the remote service.
    ///
    /// A malformed frame is dropped and reported as an error; the session
    /// carries on.
    pub async fn handle_inbound(&self, raw: &str) -> Result<(), SessionError> {
        let event = match decode_server_event(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id = %self.inner.session_id, error = %e, "Dropping malformed frame");
                return Err(e.into());
            }
        };
        self.handle_server_event(event).await
    }

    pub async fn handle_server_event(&self, event: ServerEvent) -> Result<(), SessionError> {
        let mut shared = self.inner.shared.lock().await;
        if shared.session.state() == Lifecycle::Ended {
            debug!(frame = event.kind(), "Ignoring event after session end");
            return Ok(());
        }
        if let Err(violation) = shared.session.observe(&event) {
            self.fail(&mut shared, &violation);
            return Err(violation.into());
        }

        match event {
            ServerEvent::CompletionStart(start) => {
                debug!(prompt_name = %start.prompt_name, "Completion started");
            }
            ServerEvent::ContentStart(start) => {
                debug!(content_id = %start.content_id, kind = ?start.kind, role = %start.role, "Output content started");
            }
            ServerEvent::TextOutput(output) => {
                let generation_stage = shared
                    .session
                    .prompt(&output.prompt_name)
                    .and_then(|p| p.output(&output.content_id))
                    .and_then(|o| o.generation_stage);
                self.notify(SessionEvent::TextOutput {
                    role: output.role,
                    text: output.content,
                    generation_stage,
                    stop_reason: output.stop_reason,
                });
            }
            ServerEvent::AudioOutput(output) => {
                self.notify(SessionEvent::AudioOutput(output.content));
            }
            ServerEvent::ToolUse(tool_use) => {
                self.dispatch_tool(&mut shared, &tool_use)?;
            }
            ServerEvent::ContentEnd(end) => {
                if end.is_interrupted() {
                    info!(content_id = %end.content_id, "Model output interrupted");
                    self.notify(SessionEvent::Interrupted);
                }
            }
            ServerEvent::CompletionEnd(end) => {
                self.notify(SessionEvent::CompletionEnded {
                    stop_reason: end.stop_reason,
                });
            }
            ServerEvent::UsageEvent(usage) => {
                self.notify(SessionEvent::Usage(usage));
            }
        }
        Ok(())
    }

    // --- Tool Dispatch ---

    fn dispatch_tool(&self, shared: &mut Shared, tool_use: &ToolUse) -> Result<(), SessionError> {
        let invocation = ToolInvocation::from(tool_use);
        let tool_use_id = invocation.tool_use_id.clone();
        let tool_name = invocation.tool_name.clone();

        if let Err(e) = shared.correlator.register(invocation.clone()) {
            warn!(tool_use_id = %tool_use_id, tool = %tool_name, error = %e, "Rejected tool invocation");
            self.notify(SessionEvent::ToolFailed {
                tool_use_id,
                tool_name,
                error: e.to_string(),
            });
            return Err(e.into());
        }

        info!(tool_use_id = %tool_use_id, tool = %tool_name, "Tool requested");
        self.notify(SessionEvent::ToolRequested {
            tool_use_id: tool_use_id.clone(),
            tool_name: tool_name.clone(),
            input: invocation.input.clone(),
        });

        let configured = shared
            .session
            .prompt(&invocation.prompt_name)
            .is_some_and(|p| p.tools.iter().any(|t| t.name == tool_name));
        if !configured {
            return self.deliver(shared, &tool_use_id, Err(ToolError::UnknownTool(tool_name)));
        }

        let this = self.clone();
        let executor = self.inner.executor.clone();
        let deadline = self.inner.config.tool_timeout;
        let span = info_span!("tool", session_id = %self.inner.session_id, tool_use_id = %tool_use_id, tool = %tool_name);
        let id = tool_use_id.clone();
        let task = tokio::spawn(
            async move {
                let outcome =
                    tokio::time::timeout(deadline, executor.execute(&tool_name, invocation.input))
                        .await
                        .unwrap_or_else(|_| {
                            Err(ToolError::Timeout {
                                tool: tool_name.clone(),
                                after: deadline,
                            })
                        });
                this.complete_tool(&id, outcome).await;
            }
            .instrument(span),
        );
        shared.tool_tasks.insert(tool_use_id, task.abort_handle());
        Ok(())
    }

    async fn complete_tool(&self, tool_use_id: &str, outcome: Result<Value, ToolError>) {
        let mut shared = self.inner.shared.lock().await;
        shared.tool_tasks.remove(tool_use_id);

        let deliverable = shared.session.state() == Lifecycle::Started
            && shared.correlator.get(tool_use_id).is_some_and(|invocation| {
                shared.session.active_prompt().map(|p| p.name.as_str())
                    == Some(invocation.prompt_name.as_str())
            });
        if !deliverable {
            debug!(tool_use_id = %tool_use_id, "Dropping tool result that can no longer be delivered");
            return;
        }

        if let Err(e) = self.deliver(&mut shared, tool_use_id, outcome) {
            error!(tool_use_id = %tool_use_id, error = %e, "Failed to report tool result");
        }
    }

    /// Reports a tool outcome through the correlator. Failures are sent as a
    /// textual payload so the model can respond to them.
    fn deliver(
        &self,
        shared: &mut Shared,
        tool_use_id: &str,
        outcome: Result<Value, ToolError>,
    ) -> Result<(), SessionError> {
        let (payload, failure) = match outcome {
            Ok(Value::String(text)) => (text, None),
            Ok(value) => (value.to_string(), None),
            Err(e) => (e.to_payload(), Some(e)),
        };

        let content_name = Uuid::new_v4().to_string();
        let (invocation, frames) = shared
            .correlator
            .resolve(tool_use_id, &content_name, payload)?;
        self.emit_all(shared, frames)?;

        match failure {
            None => {
                info!(tool_use_id = %tool_use_id, tool = %invocation.tool_name, "Tool result sent");
                self.notify(SessionEvent::ToolCompleted {
                    tool_use_id: invocation.tool_use_id,
                    tool_name: invocation.tool_name,
                });
            }
            Some(e) => {
                warn!(tool_use_id = %tool_use_id, tool = %invocation.tool_name, error = %e, "Tool failed");
                self.notify(SessionEvent::ToolFailed {
                    tool_use_id: invocation.tool_use_id,
                    tool_name: invocation.tool_name,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn cancel_tools(&self, shared: &mut Shared) {
        for (tool_use_id, task) in shared.tool_tasks.drain() {
            debug!(tool_use_id = %tool_use_id, "Cancelling tool dispatch");
            task.abort();
        }
        let cancelled = shared.correlator.cancel_all();
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "Cancelled pending tool invocations");
        }
    }

    // --- Emission ---

    fn emit(&self, shared: &mut Shared, frame: ClientFrame) -> Result<(), SessionError> {
        let text = encode(&frame)?;
        if let Err(violation) = shared.session.apply(&frame) {
            self.fail(shared, &violation);
            return Err(violation.into());
        }

        if !matches!(frame, ClientFrame::AudioInput(_)) {
            debug!(
                frame = frame.kind(),
                prompt_name = ?frame.prompt_name(),
                content_name = ?frame.content_name(),
                "Sending frame"
            );
        }
        if self.inner.outbound.send(Outbound::Frame(text)).is_err() {
            warn!(
                session_id = %self.inner.session_id,
                frame = frame.kind(),
                "Outbound queue has no receiver; ending session"
            );
            self.abandon(shared);
            return Err(SessionError::TransportClosed { frame: frame.kind() });
        }
        Ok(())
    }

    fn emit_all(
        &self,
        shared: &mut Shared,
        frames: impl IntoIterator<Item = ClientFrame>,
    ) -> Result<(), SessionError> {
        for frame in frames {
            self.emit(shared, frame)?;
        }
        Ok(())
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn shutdown(&self, shared: &mut Shared) -> Result<(), SessionError> {
        match shared.session.state() {
            Lifecycle::Ended => return Ok(()),
            Lifecycle::Created => {
                shared.session.terminate();
                self.notify(SessionEvent::Ended(EndReason::Closed));
                return Ok(());
            }
            Lifecycle::Started => {}
        }

        self.cancel_tools(shared);
        if let Some(prompt) = shared.session.active_prompt() {
            let prompt_name = prompt.name.clone();
            let mut open: Vec<(String, ContentKind)> = prompt
                .open_streams()
                .map(|s| (s.name.clone(), s.kind))
                .collect();
            open.sort_by_key(|(_, kind)| *kind != ContentKind::Audio);

            for (content_name, _) in open {
                self.emit(shared, ClientFrame::content_end(&prompt_name, &content_name))?;
            }
            self.emit(shared, ClientFrame::prompt_end(&prompt_name))?;
        }
        self.emit(shared, ClientFrame::session_end())?;
        shared.audio_content = None;

        info!("Session ended");
        self.notify(SessionEvent::Ended(EndReason::Closed));
        Ok(())
    }

    /// Ends the session once the transport is gone. No frames are sent.
    fn abandon(&self, shared: &mut Shared) {
        self.cancel_tools(shared);
        shared.session.terminate();
        shared.audio_content = None;
        self.notify(SessionEvent::Ended(EndReason::TransportClosed));
    }

    /// Tears the session down after a protocol violation.
    fn fail(&self, shared: &mut Shared, violation: &ProtocolViolation) {
        error!(session_id = %shared.session.id(), error = %violation, "Ending session");
        self.cancel_tools(shared);
        shared.session.terminate();
        shared.audio_content = None;
        let _ = self.inner.outbound.send(Outbound::Close);
        self.notify(SessionEvent::Ended(EndReason::ProtocolViolation(
            violation.to_string(),
        )));
    }
}

/// The prompt name of a session that accepts local input.
fn ready(shared: &Shared) -> Result<String, SessionError> {
    match shared.session.state() {
        Lifecycle::Created => Err(SessionError::NotStarted),
        Lifecycle::Ended => Err(SessionError::SessionEnded),
        Lifecycle::Started => shared.prompt_name.clone().ok_or(SessionError::NotStarted),
    }
}

fn text_turn(prompt_name: &str, role: Role, text: &str, interactive: bool) -> [ClientFrame; 3] {
    let content_name = Uuid::new_v4().to_string();
    [
        ClientFrame::text_content_start(prompt_name, &content_name, role, interactive),
        ClientFrame::text_input(prompt_name, &content_name, text),
        ClientFrame::content_end(prompt_name, &content_name),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HistoryTurn, ToolSpec};
    use crate::protocol::frame::{
        AudioOutput, ContentConfig, OutputContentEnd, OutputContentStart, TextOutput,
    };
    use crate::protocol::{decode_client_frame, encode_server_event};
    use crate::tools::MockToolExecutor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Never answers within any reasonable deadline.
    struct SlowExecutor;

    #[async_trait]
    impl ToolExecutor for SlowExecutor {
        async fn execute(&self, _name: &str, _input: Value) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("too late"))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::default()
            .with_system_prompt("You are a test assistant.")
            .with_tools(vec![ToolSpec::new(
                "getDateTool",
                "Returns today's date",
                json!({"type": "object", "properties": {}}),
            )])
            .with_tool_timeout(Duration::from_millis(100))
    }

    fn setup(executor: impl ToolExecutor + 'static) -> (SessionOrchestrator, SessionChannels) {
        SessionOrchestrator::new(config(), Arc::new(executor)).unwrap()
    }

    fn idle_executor() -> MockToolExecutor {
        let mut executor = MockToolExecutor::new();
        executor.expect_execute().times(0);
        executor
    }

    /// Everything queued so far; `None` marks a close request.
    fn drain(channels: &mut SessionChannels) -> Vec<Option<ClientFrame>> {
        let mut out = Vec::new();
        while let Ok(item) = channels.outbound.try_recv() {
            out.push(match item {
                Outbound::Frame(text) => Some(decode_client_frame(&text).unwrap()),
                Outbound::Close => None,
            });
        }
        out
    }

    fn drain_frames(channels: &mut SessionChannels) -> Vec<ClientFrame> {
        drain(channels).into_iter().flatten().collect()
    }

    fn drain_events(channels: &mut SessionChannels) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = channels.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn next_frame(channels: &mut SessionChannels) -> ClientFrame {
        match tokio::time::timeout(Duration::from_secs(2), channels.outbound.recv()).await {
            Ok(Some(Outbound::Frame(text))) => decode_client_frame(&text).unwrap(),
            other => panic!("Expected a frame, got {:?}", other),
        }
    }

    async fn next_event(channels: &mut SessionChannels) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), channels.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn started(
        executor: impl ToolExecutor + 'static,
    ) -> (SessionOrchestrator, SessionChannels, String) {
        let (orchestrator, mut channels) = setup(executor);
        let prompt = orchestrator.start_with_defaults().await.unwrap();
        drain(&mut channels);
        (orchestrator, channels, prompt)
    }

    async fn inbound(orchestrator: &SessionOrchestrator, event: ServerEvent) -> Result<(), SessionError> {
        orchestrator
            .handle_inbound(&encode_server_event(&event).unwrap())
            .await
    }

    fn tool_use(prompt: &str, id: &str, name: &str) -> ServerEvent {
        ServerEvent::ToolUse(ToolUse {
            prompt_name: prompt.to_string(),
            content_id: format!("out-{id}"),
            tool_use_id: id.to_string(),
            tool_name: name.to_string(),
            content: json!({}),
        })
    }

    fn output_start(prompt: &str, id: &str, kind: ContentKind, stage: Option<&str>) -> ServerEvent {
        ServerEvent::ContentStart(OutputContentStart {
            prompt_name: prompt.to_string(),
            content_id: id.to_string(),
            kind,
            role: Role::Assistant,
            additional_model_fields: stage.map(|s| format!(r#"{{"generationStage":"{s}"}}"#)),
        })
    }

    async fn tool_output(orchestrator: &SessionOrchestrator, prompt: &str, id: &str, name: &str) -> Result<(), SessionError> {
        inbound(orchestrator, output_start(prompt, &format!("out-{id}"), ContentKind::Tool, None)).await?;
        inbound(orchestrator, tool_use(prompt, id, name)).await
    }

    #[tokio::test]
    async fn test_start_emits_session_prompt_and_system_prompt() {
        let (orchestrator, mut channels) = setup(idle_executor());
        let prompt = orchestrator.start_with_defaults().await.unwrap();
        let frames = drain_frames(&mut channels);

        assert_eq!(frames.len(), 5);
        assert!(matches!(frames[0], ClientFrame::SessionStart(_)));
        match &frames[1] {
            ClientFrame::PromptStart(start) => {
                assert_eq!(start.prompt_name, prompt);
                assert_eq!(start.tool_configuration.tools[0].tool_spec.name, "getDateTool");
            }
            other => panic!("Expected promptStart, got {:?}", other),
        }
        match &frames[2] {
            ClientFrame::ContentStart(start) => {
                assert_eq!(start.role, Role::System);
                assert_eq!(start.config.kind(), ContentKind::Text);
            }
            other => panic!("Expected contentStart, got {:?}", other),
        }
        match &frames[3] {
            ClientFrame::TextInput(payload) => assert_eq!(payload.content, "You are a test assistant."),
            other => panic!("Expected textInput, got {:?}", other),
        }
        assert!(matches!(frames[4], ClientFrame::ContentEnd(_)));

        let session = orchestrator.snapshot().await;
        assert_eq!(session.state(), Lifecycle::Started);
        assert_eq!(session.prompt(&prompt).unwrap().state, Lifecycle::Started);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (orchestrator, _channels, _) = started(idle_executor()).await;
        assert!(matches!(
            orchestrator.start_with_defaults().await,
            Err(SessionError::AlreadyStarted)
        ));
        assert_eq!(orchestrator.state().await, Lifecycle::Started);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_inference() {
        let (orchestrator, mut channels) = setup(idle_executor());
        let inference = InferenceConfig {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(matches!(
            orchestrator.start(inference, "hi").await,
            Err(SessionError::Config(_))
        ));
        assert!(drain(&mut channels).is_empty());
    }

    #[tokio::test]
    async fn test_history_is_primed_after_system_prompt() {
        let history = vec![
            HistoryTurn {
                role: Role::User,
                text: "Hi, I'm Sam.".into(),
            },
            HistoryTurn {
                role: Role::Assistant,
                text: "Nice to meet you, Sam.".into(),
            },
        ];
        let (orchestrator, mut channels) =
            SessionOrchestrator::new(config().with_history(history), Arc::new(idle_executor())).unwrap();
        orchestrator.start_with_defaults().await.unwrap();

        let texts: Vec<String> = drain_frames(&mut channels)
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::TextInput(payload) => Some(payload.content),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec!["You are a test assistant.", "Hi, I'm Sam.", "Nice to meet you, Sam."]
        );
    }

    #[tokio::test]
    async fn test_audio_chunks_share_one_open_stream() {
        let (orchestrator, mut channels, _) = started(idle_executor()).await;
        orchestrator.send_audio_chunk(Bytes::from_static(b"b1")).await.unwrap();
        orchestrator.send_audio_chunk(Bytes::from_static(b"b2")).await.unwrap();
        let frames = drain_frames(&mut channels);

        assert_eq!(frames.len(), 3);
        match &frames[0] {
            ClientFrame::ContentStart(start) => {
                assert!(matches!(start.config, ContentConfig::Audio { .. }));
                assert_eq!(start.role, Role::User);
            }
            other => panic!("Expected contentStart, got {:?}", other),
        }
        let chunks: Vec<&[u8]> = frames[1..]
            .iter()
            .map(|frame| match frame {
                ClientFrame::AudioInput(payload) => payload.content.as_ref(),
                other => panic!("Expected audioInput, got {:?}", other),
            })
            .collect();
        assert_eq!(chunks, vec![&b"b1"[..], &b"b2"[..]]);
    }

    #[tokio::test]
    async fn test_end_audio_input_closes_stream_and_next_chunk_reopens() {
        let (orchestrator, mut channels, _) = started(idle_executor()).await;
        orchestrator.send_audio_chunk(Bytes::from_static(b"a")).await.unwrap();
        orchestrator.end_audio_input().await.unwrap();
        orchestrator.end_audio_input().await.unwrap();
        orchestrator.send_audio_chunk(Bytes::from_static(b"b")).await.unwrap();

        let kinds: Vec<&str> = drain_frames(&mut channels).iter().map(|f| f.kind()).collect();
        assert_eq!(
            kinds,
            vec!["contentStart", "audioInput", "contentEnd", "contentStart", "audioInput"]
        );
    }

    #[tokio::test]
    async fn test_user_text_is_one_atomic_turn() {
        let (orchestrator, mut channels, _) = started(idle_executor()).await;
        orchestrator.send_audio_chunk(Bytes::from_static(b"a")).await.unwrap();
        orchestrator.send_user_text("What day is it?").await.unwrap();
        let frames = drain_frames(&mut channels);

        match &frames[2] {
            ClientFrame::ContentStart(start) => {
                assert_eq!(start.role, Role::User);
                assert!(start.interactive);
                assert_eq!(start.config.kind(), ContentKind::Text);
            }
            other => panic!("Expected contentStart, got {:?}", other),
        }
        assert_eq!(frames[3].kind(), "textInput");
        assert_eq!(frames[4].kind(), "contentEnd");

        let session = orchestrator.snapshot().await;
        let open: Vec<ContentKind> = session
            .active_prompt()
            .unwrap()
            .open_streams()
            .map(|s| s.kind)
            .collect();
        assert_eq!(open, vec![ContentKind::Audio]);
    }

    #[tokio::test]
    async fn test_local_calls_before_start_fail_without_frames() {
        let (orchestrator, mut channels) = setup(idle_executor());
        assert!(matches!(
            orchestrator.send_user_text("hello").await,
            Err(SessionError::NotStarted)
        ));
        assert!(matches!(
            orchestrator.send_audio_chunk(Bytes::from_static(b"x")).await,
            Err(SessionError::NotStarted)
        ));
        assert!(drain(&mut channels).is_empty());
        assert_eq!(orchestrator.state().await, Lifecycle::Created);
    }

    #[tokio::test]
    async fn test_tool_invocation_reports_result_through_tool_stream() {
        let mut executor = MockToolExecutor::new();
        executor
            .expect_execute()
            .withf(|name, _| name == "getDateTool")
            .times(1)
            .returning(|_, _| Ok(json!({"date": "2024-01-01"})));
        let (orchestrator, mut channels, prompt) = started(executor).await;

        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();

        match next_frame(&mut channels).await {
            ClientFrame::ContentStart(start) => {
                assert_eq!(start.prompt_name, prompt);
                assert_eq!(start.role, Role::Tool);
                assert_eq!(start.config.tool_use_id(), Some("t1"));
            }
            other => panic!("Expected contentStart, got {:?}", other),
        }
        match next_frame(&mut channels).await {
            ClientFrame::ToolResult(payload) => {
                let value: Value = serde_json::from_str(&payload.content).unwrap();
                assert_eq!(value, json!({"date": "2024-01-01"}));
            }
            other => panic!("Expected toolResult, got {:?}", other),
        }
        assert_eq!(next_frame(&mut channels).await.kind(), "contentEnd");
        assert!(orchestrator.pending_tool_ids().await.is_empty());

        assert!(matches!(
            next_event(&mut channels).await,
            SessionEvent::ToolRequested { ref tool_use_id, .. } if tool_use_id == "t1"
        ));
        assert!(matches!(
            next_event(&mut channels).await,
            SessionEvent::ToolCompleted { ref tool_name, .. } if tool_name == "getDateTool"
        ));
    }

    #[tokio::test]
    async fn test_tool_result_while_audio_is_streaming() {
        let mut executor = MockToolExecutor::new();
        executor
            .expect_execute()
            .returning(|_, _| Ok(json!("It is noon.")));
        let (orchestrator, mut channels, prompt) = started(executor).await;
        orchestrator.send_audio_chunk(Bytes::from_static(b"a")).await.unwrap();
        drain(&mut channels);

        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();
        assert_eq!(next_frame(&mut channels).await.kind(), "contentStart");
        match next_frame(&mut channels).await {
            ClientFrame::ToolResult(payload) => assert_eq!(payload.content, "It is noon."),
            other => panic!("Expected toolResult, got {:?}", other),
        }
        assert_eq!(next_frame(&mut channels).await.kind(), "contentEnd");

        orchestrator.send_audio_chunk(Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(next_frame(&mut channels).await.kind(), "audioInput");
    }

    #[tokio::test]
    async fn test_tool_failure_is_reported_as_text() {
        let mut executor = MockToolExecutor::new();
        executor.expect_execute().returning(|name, _| {
            Err(ToolError::ExecutionFailure {
                tool: name.to_string(),
                message: "clock unavailable".into(),
            })
        });
        let (orchestrator, mut channels, prompt) = started(executor).await;

        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();
        next_frame(&mut channels).await;
        match next_frame(&mut channels).await {
            ClientFrame::ToolResult(payload) => {
                let value: Value = serde_json::from_str(&payload.content).unwrap();
                assert_eq!(value["status"], "error");
                assert!(value["message"].as_str().unwrap().contains("clock unavailable"));
            }
            other => panic!("Expected toolResult, got {:?}", other),
        }
        next_frame(&mut channels).await;

        next_event(&mut channels).await;
        assert!(matches!(next_event(&mut channels).await, SessionEvent::ToolFailed { .. }));
        assert_eq!(orchestrator.state().await, Lifecycle::Started);
    }

    #[tokio::test]
    async fn test_slow_tool_times_out_as_failure() {
        let (orchestrator, mut channels, prompt) = started(SlowExecutor).await;

        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();
        next_frame(&mut channels).await;
        match next_frame(&mut channels).await {
            ClientFrame::ToolResult(payload) => assert!(payload.content.contains("timed out")),
            other => panic!("Expected toolResult, got {:?}", other),
        }
        assert!(orchestrator.pending_tool_ids().await.is_empty());
        assert_eq!(orchestrator.state().await, Lifecycle::Started);
    }

    #[tokio::test]
    async fn test_unconfigured_tool_fails_without_execution() {
        let (orchestrator, mut channels, prompt) = started(idle_executor()).await;

        tool_output(&orchestrator, &prompt, "t1", "getWeather").await.unwrap();
        let frames = drain_frames(&mut channels);
        assert_eq!(frames.len(), 3);
        match &frames[1] {
            ClientFrame::ToolResult(payload) => {
                assert!(payload.content.contains("'getWeather' is not configured"))
            }
            other => panic!("Expected toolResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_tool_use_id_is_rejected() {
        let (orchestrator, mut channels, prompt) = started(SlowExecutor).await;

        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();
        inbound(&orchestrator, output_start(&prompt, "out-again", ContentKind::Tool, None))
            .await
            .unwrap();
        let mut second = tool_use(&prompt, "t1", "getDateTool");
        if let ServerEvent::ToolUse(tool_use) = &mut second {
            tool_use.content_id = "out-again".into();
        }

        let err = inbound(&orchestrator, second).await.unwrap_err();
        assert!(matches!(err, SessionError::Tool(ToolError::DuplicateToolUseId(ref id)) if id == "t1"));
        assert_eq!(orchestrator.state().await, Lifecycle::Started);
        assert_eq!(orchestrator.pending_tool_ids().await, vec!["t1".to_string()]);
        assert!(drain_frames(&mut channels).is_empty());
    }

    #[tokio::test]
    async fn test_submitted_result_succeeds_exactly_once() {
        let (orchestrator, mut channels, prompt) = started(SlowExecutor).await;
        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();

        orchestrator
            .submit_tool_result("t1", json!({"date": "2024-01-01"}))
            .await
            .unwrap();
        assert_eq!(drain_frames(&mut channels).len(), 3);

        let err = orchestrator
            .submit_tool_result("t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Tool(ToolError::UnknownToolUseId(_))));
        assert_eq!(orchestrator.state().await, Lifecycle::Started);
    }

    #[tokio::test]
    async fn test_inbound_outputs_become_events() {
        let (orchestrator, mut channels, prompt) = started(idle_executor()).await;

        inbound(&orchestrator, output_start(&prompt, "c1", ContentKind::Text, Some("FINAL")))
            .await
            .unwrap();
        inbound(
            &orchestrator,
            ServerEvent::TextOutput(TextOutput {
                prompt_name: prompt.clone(),
                content_id: "c1".into(),
                role: Role::Assistant,
                content: "Hello there!".into(),
                stop_reason: None,
            }),
        )
        .await
        .unwrap();
        inbound(&orchestrator, output_start(&prompt, "c2", ContentKind::Audio, None))
            .await
            .unwrap();
        inbound(
            &orchestrator,
            ServerEvent::AudioOutput(AudioOutput {
                prompt_name: prompt.clone(),
                content_id: "c2".into(),
                content: Bytes::from_static(b"pcm"),
            }),
        )
        .await
        .unwrap();
        inbound(
            &orchestrator,
            ServerEvent::ContentEnd(OutputContentEnd {
                prompt_name: prompt.clone(),
                content_id: "c2".into(),
                kind: Some(ContentKind::Audio),
                stop_reason: Some("INTERRUPTED".into()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            drain_events(&mut channels),
            vec![
                SessionEvent::TextOutput {
                    role: Role::Assistant,
                    text: "Hello there!".into(),
                    generation_stage: Some(crate::protocol::GenerationStage::Final),
                    stop_reason: None,
                },
                SessionEvent::AudioOutput(Bytes::from_static(b"pcm")),
                SessionEvent::Interrupted,
            ]
        );
    }

    #[tokio::test]
    async fn test_text_output_stop_reason_is_passed_along() {
        let (orchestrator, mut channels, prompt) = started(idle_executor()).await;
        inbound(&orchestrator, output_start(&prompt, "c1", ContentKind::Text, None))
            .await
            .unwrap();
        orchestrator
            .handle_inbound(
                &json!({"event": {"textOutput": {
                    "promptName": prompt,
                    "contentId": "c1",
                    "role": "ASSISTANT",
                    "content": "All done here.",
                    "stopReason": "END_TURN"
                }}})
                .to_string(),
            )
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut channels).await,
            SessionEvent::TextOutput {
                role: Role::Assistant,
                text: "All done here.".into(),
                generation_stage: None,
                stop_reason: Some("END_TURN".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_inbound_frame_is_dropped() {
        let (orchestrator, mut channels, _) = started(idle_executor()).await;
        let err = orchestrator.handle_inbound("{\"event\":{\"nope\":{}}}").await.unwrap_err();

        assert!(matches!(err, SessionError::Codec(CodecError::MalformedFrame { .. })));
        assert_eq!(orchestrator.state().await, Lifecycle::Started);
        assert!(drain(&mut channels).is_empty());
    }

    #[tokio::test]
    async fn test_inbound_violation_ends_session() {
        let (orchestrator, mut channels, prompt) = started(idle_executor()).await;
        let err = inbound(
            &orchestrator,
            ServerEvent::TextOutput(TextOutput {
                prompt_name: prompt,
                content_id: "never-started".into(),
                role: Role::Assistant,
                content: "?".into(),
                stop_reason: None,
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::Protocol(_)));
        assert_eq!(orchestrator.state().await, Lifecycle::Ended);
        assert_eq!(drain(&mut channels), vec![None]);
        assert!(matches!(
            drain_events(&mut channels).last(),
            Some(SessionEvent::Ended(EndReason::ProtocolViolation(_)))
        ));

        // Later events are ignored rather than re-reported.
        assert!(inbound(&orchestrator, ServerEvent::UsageEvent(json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_orders_frames_and_is_idempotent() {
        let (orchestrator, mut channels, _) = started(idle_executor()).await;
        orchestrator.send_audio_chunk(Bytes::from_static(b"a")).await.unwrap();
        drain(&mut channels);

        orchestrator.close().await.unwrap();
        let out = drain(&mut channels);
        let kinds: Vec<&str> = out
            .iter()
            .map(|item| item.as_ref().map_or("close", |f| f.kind()))
            .collect();
        assert_eq!(kinds, vec!["contentEnd", "promptEnd", "sessionEnd", "close"]);
        assert_eq!(orchestrator.state().await, Lifecycle::Ended);

        orchestrator.close().await.unwrap();
        assert!(drain(&mut channels).is_empty());
        assert_eq!(orchestrator.state().await, Lifecycle::Ended);
        assert!(matches!(
            orchestrator.send_audio_chunk(Bytes::from_static(b"b")).await,
            Err(SessionError::SessionEnded)
        ));
    }

    #[tokio::test]
    async fn test_end_turn_keeps_transport_open() {
        let (orchestrator, mut channels, _) = started(idle_executor()).await;
        orchestrator.end_turn().await.unwrap();

        let out = drain(&mut channels);
        assert!(out.iter().all(Option::is_some));
        assert_eq!(out.len(), 2);
        assert_eq!(
            drain_events(&mut channels),
            vec![SessionEvent::Ended(EndReason::Closed)]
        );
        orchestrator.end_turn().await.unwrap();
        assert!(drain(&mut channels).is_empty());
    }

    #[tokio::test]
    async fn test_end_turn_before_start_is_rejected() {
        let (orchestrator, mut channels) = setup(idle_executor());
        assert!(matches!(
            orchestrator.end_turn().await,
            Err(SessionError::NotStarted)
        ));
        assert_eq!(orchestrator.state().await, Lifecycle::Created);
        assert!(drain(&mut channels).is_empty());
        assert!(drain_events(&mut channels).is_empty());

        orchestrator.start_with_defaults().await.unwrap();
        assert_eq!(orchestrator.state().await, Lifecycle::Started);
    }

    #[tokio::test]
    async fn test_lost_outbound_receiver_ends_session_with_error() {
        let (orchestrator, channels, _) = started(idle_executor()).await;
        let SessionChannels {
            outbound,
            mut events,
        } = channels;
        drop(outbound);

        assert!(matches!(
            orchestrator.send_user_text("hello?").await,
            Err(SessionError::TransportClosed { frame: "contentStart" })
        ));
        assert_eq!(orchestrator.state().await, Lifecycle::Ended);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended(EndReason::TransportClosed)
        );
        assert!(matches!(
            orchestrator.send_audio_chunk(Bytes::from_static(b"x")).await,
            Err(SessionError::SessionEnded)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_outbound_receiver_cancels_pending_tools() {
        let (orchestrator, channels, prompt) = started(SlowExecutor).await;
        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();
        drop(channels.outbound);

        assert!(matches!(
            orchestrator.send_audio_chunk(Bytes::from_static(b"x")).await,
            Err(SessionError::TransportClosed { .. })
        ));
        assert!(orchestrator.pending_tool_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_tools() {
        let (orchestrator, mut channels, prompt) = started(SlowExecutor).await;
        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();
        assert_eq!(orchestrator.pending_tool_ids().await, vec!["t1".to_string()]);

        orchestrator.close().await.unwrap();
        assert!(orchestrator.pending_tool_ids().await.is_empty());
        let kinds: Vec<Option<&str>> = drain(&mut channels)
            .iter()
            .map(|item| item.as_ref().map(|f| f.kind()))
            .collect();
        assert!(!kinds.contains(&Some("toolResult")));
    }

    #[tokio::test]
    async fn test_close_before_start_only_closes_transport() {
        let (orchestrator, mut channels) = setup(idle_executor());
        orchestrator.close().await.unwrap();

        assert_eq!(drain(&mut channels), vec![None]);
        assert_eq!(orchestrator.state().await, Lifecycle::Ended);
    }

    #[tokio::test]
    async fn test_transport_closed_ends_without_frames() {
        let (orchestrator, mut channels, prompt) = started(SlowExecutor).await;
        orchestrator.send_audio_chunk(Bytes::from_static(b"a")).await.unwrap();
        tool_output(&orchestrator, &prompt, "t1", "getDateTool").await.unwrap();
        drain(&mut channels);
        drain_events(&mut channels);

        orchestrator.transport_closed().await;
        orchestrator.transport_closed().await;

        assert!(drain(&mut channels).is_empty());
        assert_eq!(orchestrator.state().await, Lifecycle::Ended);
        assert!(orchestrator.pending_tool_ids().await.is_empty());
        assert_eq!(
            drain_events(&mut channels),
            vec![SessionEvent::Ended(EndReason::TransportClosed)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_keep_frames_ordered() {
        let (orchestrator, mut channels, _) = started(idle_executor()).await;
        let audio = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                for i in 0..20u8 {
                    orchestrator.send_audio_chunk(Bytes::from(vec![i])).await.unwrap();
                }
            })
        };
        let text = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    orchestrator.send_user_text(&format!("turn {i}")).await.unwrap();
                }
            })
        };
        audio.await.unwrap();
        text.await.unwrap();

        let frames = drain_frames(&mut channels);
        let chunks: Vec<u8> = frames
            .iter()
            .filter_map(|frame| match frame {
                ClientFrame::AudioInput(payload) => Some(payload.content[0]),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, (0..20u8).collect::<Vec<_>>());

        // Replaying the emitted frames through a fresh state machine accepts every one.
        let mut replay = Session::new("replay");
        let mut all = vec![
            ClientFrame::session_start(InferenceConfig::default()),
            ClientFrame::prompt_start(
                orchestrator.prompt_name().await.unwrap(),
                Default::default(),
                &[],
            ),
        ];
        all.extend(frames);
        for frame in &all {
            replay.apply(frame).unwrap();
        }
    }
}
