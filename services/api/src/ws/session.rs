//! Manages the browser WebSocket connection lifecycle for one speech session.

use super::{
    protocol::{ClientMessage, ServerMessage},
    upstream::{self, UpstreamStream, WriterExit},
};
use crate::state::AppState;
use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use rmcp::ServiceExt;
use s2s_core::builtin_tools::AssistantToolService;
use s2s_core::{McpToolExecutor, SessionEvent, SessionOrchestrator};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{Instrument, debug, error, info, instrument, warn};

/// How long teardown waits for the last frames to reach the upstream service.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type BrowserSink = SplitSink<WebSocket, Message>;
type BrowserStream = SplitStream<WebSocket>;

/// Per-connection choices a browser may make in its `init` message.
#[derive(Debug, Default)]
struct SessionOverrides {
    voice_id: Option<String>,
    system_prompt: Option<String>,
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// The first message from the browser must be `init`. After that the
/// connection is bridged to a fresh session against the upstream service
/// until either side hangs up.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting initialization...");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let overrides = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(text.as_str()),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };

    let result = match overrides {
        Ok(overrides) => run_session(&state, &mut socket_tx, socket_rx, overrides).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(error = ?e, "Session terminated with error.");
        let _ = send_msg(
            &mut socket_tx,
            ServerMessage::Error {
                message: e.to_string(),
            },
        )
        .await;
    }
    let _ = socket_tx.close().await;
    info!("WebSocket connection closed.");
}

fn parse_init(text: &str) -> Result<SessionOverrides> {
    match serde_json::from_str::<ClientMessage>(text).context("Invalid `init` message")? {
        ClientMessage::Init {
            voice_id,
            system_prompt,
        } => Ok(SessionOverrides {
            voice_id,
            system_prompt,
        }),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// Serves the per-session tool server and runs the session against it.
async fn run_session(
    state: &Arc<AppState>,
    socket_tx: &mut BrowserSink,
    socket_rx: BrowserStream,
    overrides: SessionOverrides,
) -> Result<()> {
    let tool_service = AssistantToolService::new(state.knowledge_base.clone());
    let (server_transport, client_transport) = tokio::io::duplex(4096);

    let tool_handle = tokio::spawn(
        async move {
            match tool_service.serve(server_transport).await {
                Ok(service) => {
                    let _ = service.waiting().await;
                }
                Err(e) => error!(error = %e, "Tool server failed to start"),
            }
        }
        .instrument(tracing::info_span!("tool_server")),
    );

    let result = bridge(state, socket_tx, socket_rx, client_transport, overrides).await;
    tool_handle.abort();
    result
}

/// Builds the session, connects upstream, and pumps traffic until the
/// session ends.
async fn bridge(
    state: &Arc<AppState>,
    socket_tx: &mut BrowserSink,
    mut socket_rx: BrowserStream,
    tool_transport: tokio::io::DuplexStream,
    overrides: SessionOverrides,
) -> Result<()> {
    let mcp_client = ()
        .serve(tool_transport)
        .await
        .context("Failed to connect to the tool server")?;
    let executor = McpToolExecutor::new(mcp_client);
    let tools = executor.tool_specs().await?;

    let mut config = state.session_defaults.clone().with_tools(tools);
    if let Some(voice_id) = overrides.voice_id {
        config = config.with_voice(voice_id);
    }
    if let Some(system_prompt) = overrides.system_prompt {
        config = config.with_system_prompt(system_prompt);
    }

    let (orchestrator, channels) = SessionOrchestrator::new(config, Arc::new(executor))?;
    tracing::Span::current().record("session_id", orchestrator.session_id());

    let (upstream_tx, upstream_rx) = upstream::connect(&state.config.upstream_url).await?;
    let mut writer = upstream::spawn_writer(upstream_tx, channels.outbound);

    let prompt_name = orchestrator.start_with_defaults().await?;
    if let Some(log) = &state.conversation_log {
        if let Err(e) = log.log_session_start(orchestrator.session_id()).await {
            warn!(error = %e, "Failed to write conversation log");
        }
    }

    let tools = orchestrator
        .config()
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    send_msg(
        socket_tx,
        ServerMessage::Initialized {
            session_id: orchestrator.session_id().to_string(),
            prompt_name,
            tools,
        },
    )
    .await?;

    let writer_running = pump(
        state,
        &orchestrator,
        socket_tx,
        &mut socket_rx,
        upstream_rx,
        &mut writer,
        channels.events,
    )
    .await;

    // Teardown: finish the session, then let the writer drain.
    if let Err(e) = orchestrator.close().await {
        warn!(error = %e, "Session did not close cleanly");
    }
    let session_id = orchestrator.session_id().to_string();
    drop(orchestrator);

    if writer_running
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        warn!("Upstream writer did not finish in time; aborting it");
        writer.abort();
    }

    if let Some(log) = &state.conversation_log {
        if let Err(e) = log.log_session_end(&session_id).await {
            warn!(error = %e, "Failed to write conversation log");
        }
    }
    info!("Session finished.");
    Ok(())
}

/// The main event loop for an active session.
///
/// Browser audio and commands flow into the orchestrator, upstream frames are
/// decoded by it, and the events it reports flow back out to the browser.
/// Returns whether the upstream writer is still running.
async fn pump(
    state: &Arc<AppState>,
    orchestrator: &SessionOrchestrator,
    socket_tx: &mut BrowserSink,
    socket_rx: &mut BrowserStream,
    mut upstream_rx: UpstreamStream,
    writer: &mut JoinHandle<WriterExit>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) -> bool {
    let mut upstream_open = true;
    let mut writer_running = true;

    loop {
        tokio::select! {
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = orchestrator.send_audio_chunk(data).await {
                        warn!(error = %e, "Dropping microphone audio");
                    }
                }
                Some(Ok(Message::Text(text))) => handle_client_text(orchestrator, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client disconnected.");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    error!("Error receiving from client WebSocket: {:?}", e);
                    break;
                }
            },
            frame = upstream_rx.next(), if upstream_open => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Err(e) = orchestrator.handle_inbound(text.as_str()).await {
                        debug!(error = %e, "Inbound frame rejected");
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    upstream_open = false;
                    orchestrator.transport_closed().await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Error receiving from upstream");
                    upstream_open = false;
                    orchestrator.transport_closed().await;
                }
            },
            exit = &mut *writer, if writer_running => {
                writer_running = false;
                writer_stopped(orchestrator, exit).await;
            },
            event = events.recv() => match event {
                Some(event) => {
                    let ended = matches!(event, SessionEvent::Ended(_));
                    if let Err(e) = forward_event(state, socket_tx, event).await {
                        warn!(error = %e, "Failed to forward event to client");
                        break;
                    }
                    if ended {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    writer_running
}

/// Ends the session when the writer stopped without being asked to, so
/// nothing keeps queueing frames that can no longer be delivered.
async fn writer_stopped(
    orchestrator: &SessionOrchestrator,
    exit: std::result::Result<WriterExit, JoinError>,
) {
    match exit {
        Ok(WriterExit::Closed) => debug!("Upstream writer closed the connection"),
        Ok(exit) => {
            warn!(exit = ?exit, "Upstream writer stopped early");
            orchestrator.transport_closed().await;
        }
        Err(e) => {
            error!(error = %e, "Upstream writer task failed");
            orchestrator.transport_closed().await;
        }
    }
}

async fn handle_client_text(orchestrator: &SessionOrchestrator, text: &str) {
    let result = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::UserText { text }) => orchestrator.send_user_text(&text).await,
        Ok(ClientMessage::EndAudio) => orchestrator.end_audio_input().await,
        Ok(ClientMessage::EndTurn) => orchestrator.end_turn().await,
        Ok(ClientMessage::Init { .. }) => {
            warn!("Ignoring repeated `init` message.");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable client message.");
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "Client command rejected");
    }
}

async fn forward_event(
    state: &Arc<AppState>,
    socket_tx: &mut BrowserSink,
    event: SessionEvent,
) -> Result<()> {
    match &event {
        SessionEvent::AudioOutput(chunk) => {
            socket_tx.send(Message::Binary(chunk.clone())).await?;
            return Ok(());
        }
        SessionEvent::TextOutput {
            role,
            text,
            generation_stage,
            stop_reason,
        } => {
            if let Some(log) = &state.conversation_log {
                if let Err(e) = log
                    .log_text(*role, *generation_stage, stop_reason.as_deref(), text)
                    .await
                {
                    warn!(error = %e, "Failed to write conversation log");
                }
            }
        }
        SessionEvent::CompletionEnded { stop_reason } => {
            debug!(stop_reason = ?stop_reason, "Completion ended");
        }
        SessionEvent::Usage(usage) => debug!(usage = %usage, "Usage reported"),
        _ => {}
    }

    if let Some(msg) = ServerMessage::from_event(&event) {
        send_msg(socket_tx, msg).await?;
    }
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(socket_tx: &mut BrowserSink, msg: ServerMessage) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
