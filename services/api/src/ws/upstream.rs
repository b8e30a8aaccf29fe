//! The WebSocket connection to the remote speech-to-speech model.
//!
//! Reading is left to the session loop; writing is a dedicated task that
//! drains the orchestrator's outbound queue in order.

use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use s2s_core::Outbound;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, warn};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type UpstreamSink = SplitSink<UpstreamSocket, WsMessage>;
pub type UpstreamStream = SplitStream<UpstreamSocket>;

/// Opens the upstream connection and splits it into its two halves.
pub async fn connect(url: &str) -> Result<(UpstreamSink, UpstreamStream)> {
    let (ws_stream, _) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to upstream at {}", url))?;
    info!(url = %url, "Connected to upstream speech service");
    Ok(ws_stream.split())
}

/// Why the writer task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The session asked for the connection to be closed.
    Closed,
    /// Every sender of the queue is gone.
    Drained,
    /// A write failed; frames still queued were not delivered.
    Failed,
}

/// Spawns the task that forwards outbound frames to the upstream socket.
///
/// The task stops after a close request, after a failed write, or once every
/// sender of the queue is gone, and reports which of those happened.
pub fn spawn_writer(
    mut sink: UpstreamSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<WriterExit> {
    tokio::spawn(async move {
        let mut exit = WriterExit::Drained;
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        warn!(error = %e, "Failed to write to upstream; dropping the writer");
                        return WriterExit::Failed;
                    }
                }
                Outbound::Close => {
                    debug!("Closing upstream connection on request");
                    exit = WriterExit::Closed;
                    break;
                }
            }
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "Upstream close did not complete cleanly");
        }
        exit
    })
}
