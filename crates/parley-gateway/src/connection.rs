//! WebSocket voice connection: adapts the socket to the session's frame
//! source and audio sink, then runs the session to completion.
//!
//! Inbound binary messages are raw audio frames in the configured format; text
//! messages are ignored. Outbound audio goes out as binary messages and events
//! as JSON text, in the order the session produced them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_core::backend::{AudioSink, ChannelError, FrameSource};
use parley_core::protocol::ServerEvent;
use parley_core::types::{AudioFormat, AudioFrame};
use parley_session::Session;

use crate::state::GatewayState;

/// Upper bound on flushing queued output after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// One queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Audio(Vec<u8>),
    Event(String),
}

impl From<Outbound> for Message {
    fn from(out: Outbound) -> Self {
        match out {
            Outbound::Audio(bytes) => Message::Binary(bytes.into()),
            Outbound::Event(json) => Message::Text(json.into()),
        }
    }
}

/// Audio sink backed by the connection's ordered outbound queue.
#[derive(Debug, Clone)]
pub struct WsSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl WsSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

impl AudioSink for WsSink {
    fn send_audio(&self, chunk: Vec<u8>) -> Result<(), ChannelError> {
        self.tx
            .send(Outbound::Audio(chunk))
            .map_err(|_| ChannelError::Closed)
    }

    fn send_event(&self, event: &ServerEvent) -> Result<(), ChannelError> {
        let json = event
            .to_json()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        self.tx
            .send(Outbound::Event(json))
            .map_err(|_| ChannelError::Closed)
    }
}

/// Frame source over the read half of the socket.
pub struct WsFrameSource<S> {
    rx: S,
    format: AudioFormat,
}

impl<S> WsFrameSource<S> {
    pub fn new(rx: S, format: AudioFormat) -> Self {
        Self { rx, format }
    }
}

#[async_trait]
impl FrameSource for WsFrameSource<SplitStream<WebSocket>> {
    async fn recv_frame(&mut self) -> Result<Option<AudioFrame>, ChannelError> {
        while let Some(msg_result) = self.rx.next().await {
            match msg_result {
                Ok(Message::Binary(bytes)) => {
                    return Ok(Some(AudioFrame::new(bytes.to_vec(), self.format)));
                }
                Ok(Message::Text(_)) => {
                    debug!("Ignoring text message on voice socket");
                }
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => {
                    // Axum answers pings itself
                }
                Err(e) => return Err(ChannelError::Transport(e.to_string())),
            }
        }
        Ok(None)
    }
}

/// Forward queued output to the socket until the queue closes or a write fails.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = out_rx.recv().await {
        if let Err(e) = ws_tx.send(out.into()).await {
            debug!(%e, "Socket write failed, dropping outbound queue");
            return;
        }
    }
    let _ = ws_tx.close().await;
}

/// Handle a new voice WebSocket connection.
pub async fn handle_voice_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let (ws_tx, ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
    let sink = WsSink::new(out_tx);

    let session = Session::new(
        WsFrameSource::new(ws_rx, state.settings.format),
        Arc::new(sink.clone()),
        state.backends.clone(),
        state.settings,
    )
    .with_shutdown(state.shutdown.child_token());
    let session_id = session.id().to_string();

    state.register(&session_id).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();
    info!(session_id = %session_id, "Voice connection opened");

    // Queued ahead of anything the session emits
    if sink
        .send_event(&ServerEvent::Ready {
            session_id: session_id.clone(),
            audio: state.backends.synthesizer.output_format(),
        })
        .is_err()
    {
        warn!(session_id = %session_id, "Failed to queue ready event");
    }
    let mut send_task = tokio::spawn(write_loop(ws_tx, out_rx));

    let summary = session.run().await;

    // Last sender gone: the writer drains what is queued, then closes.
    drop(sink);
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        send_task.abort();
    }

    if let Some(conn) = state.unregister(&session_id).await {
        info!(
            session_id = %session_id,
            turns = summary.turns,
            barge_ins = summary.barge_ins,
            connected_secs = conn.connected_at.elapsed().as_secs(),
            "Voice connection closed"
        );
    }
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
}
