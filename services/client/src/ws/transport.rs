//! The duplex WebSocket connection to the backend's realtime endpoint.

use super::{protocol::OutboundEnvelope, session::SessionEvent};
use crate::error::SessionError;
use futures_util::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

const SUBPROTOCOL: &str = "realtime";

/// A live connection as seen by the session: an outbound queue plus the
/// tasks pumping frames in each direction.
#[derive(Debug)]
pub struct Link {
    id: u64,
    outbound: mpsc::Sender<OutboundEnvelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn new(id: u64, outbound: mpsc::Sender<OutboundEnvelope>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { id, outbound, tasks }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, envelope: OutboundEnvelope) -> Result<(), SessionError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| SessionError::Transport("connection writer has stopped".to_string()))
    }

    /// Stops reading immediately. The writer drains what is queued, then
    /// sends a close frame once the outbound queue is dropped.
    pub fn shutdown(self) {
        if let Some(reader) = self.tasks.first() {
            reader.abort();
        }
    }
}

/// Dials `url` and starts the reader and writer tasks.
///
/// Inbound text frames are forwarded as [`SessionEvent::Frame`]; a peer close
/// or read error produces [`SessionEvent::PeerClosed`] and a failed write
/// produces [`SessionEvent::SendFailed`], both tagged with `link_id`.
pub async fn connect(
    url: &str,
    link_id: u64,
    events: mpsc::Sender<SessionEvent>,
) -> Result<Link, SessionError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        SUBPROTOCOL
            .parse()
            .map_err(|_| SessionError::Transport("invalid subprotocol header".to_string()))?,
    );

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| SessionError::Transport(format!("Failed to connect to {url}: {e}")))?;
    let (mut sink, mut stream) = ws_stream.split();
    info!(%url, link_id, "Connected to realtime endpoint.");

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    let frame = SessionEvent::Frame {
                        link: link_id,
                        text: text.as_str().to_owned(),
                    };
                    if reader_events.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "Peer closed the connection.");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Error reading from realtime connection.");
                    break;
                }
            }
        }
        let _ = reader_events
            .send(SessionEvent::PeerClosed { link: link_id })
            .await;
    });

    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundEnvelope>(128);
    let writer = tokio::spawn(write_envelopes(sink, outbound_rx, events, link_id));

    Ok(Link::new(link_id, outbound_tx, vec![reader, writer]))
}

/// Serializes queued envelopes into `sink` until the queue closes or a write fails.
///
/// A write failure is reported without waiting on the event queue, then the
/// outbound queue is dropped so a session blocked on a full queue sees the
/// link as closed.
async fn write_envelopes<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundEnvelope>,
    events: mpsc::Sender<SessionEvent>,
    link_id: u64,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    while let Some(envelope) = outbound.recv().await {
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to serialize outbound envelope.");
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            let failure = SessionEvent::SendFailed {
                link: link_id,
                reason: e.to_string(),
            };
            if let Err(TrySendError::Full(_)) = events.try_send(failure) {
                warn!(link_id, error = %e, "Event queue full; send failure surfaces as a closed link.");
            }
            return;
        }
    }
    debug!("Outbound queue closed; closing connection.");
    let _ = sink.close().await;
}
