//! Per-connection glue between a WebSocket and the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_broker::{drain, BrokerError, BrokerHandle, OutboundSink, Session, TransportWriteError};
use relay_core::{Envelope, MessageType};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const ACK_RECEIVED: &str = "received";

/// Write half of a client socket.
pub struct WsSink {
    inner: SplitSink<WebSocket, WsMessage>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, WsMessage>) -> Self {
        Self { inner }
    }

    async fn close(&mut self) {
        let _ = self.inner.send(WsMessage::Close(None)).await;
    }
}

#[async_trait]
impl OutboundSink for WsSink {
    async fn write(&mut self, payload: Bytes) -> Result<(), TransportWriteError> {
        let frame = match std::str::from_utf8(&payload) {
            Ok(text) => WsMessage::Text(text.into()),
            Err(_) => WsMessage::Binary(payload),
        };
        self.inner
            .send(frame)
            .await
            .map_err(|e| TransportWriteError(e.to_string()))
    }

    async fn heartbeat(&mut self) -> Result<(), TransportWriteError> {
        self.inner
            .send(WsMessage::Ping(Bytes::new()))
            .await
            .map_err(|e| TransportWriteError(e.to_string()))
    }
}

/// Run one registered connection to completion: a writer draining the
/// session queue and a reader dispatching client envelopes. Issues exactly
/// one unregister when either side stops.
pub async fn handle_ws_connection(
    socket: WebSocket,
    session: Arc<Session>,
    rx: relay_broker::OutboundReceiver,
    broker: BrokerHandle,
    heartbeat: Duration,
) {
    let session_id = session.id();
    let (ws_tx, ws_rx) = socket.split();

    let mut writer = tokio::spawn(async move {
        let mut sink = WsSink::new(ws_tx);
        match drain(rx, &mut sink, Some(heartbeat)).await {
            Ok(written) => {
                tracing::debug!(session_id = %session_id, written, "Send queue closed");
                sink.close().await;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Write failed");
            }
        }
    });

    let mut reader = tokio::spawn(read_loop(ws_rx, Arc::clone(&session), broker.clone()));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {}
    }

    match broker.unregister(&session).await {
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(session_id = %session_id, error = %e, "Unregister after broker stop");
            session.close();
        }
    }
    tracing::info!(session_id = %session_id, "WebSocket client disconnected");
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    session: Arc<Session>,
    broker: BrokerHandle,
) {
    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(session_id = %session.id(), error = %e, "Read failed");
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => {
                if let Err(e) = handle_frame(&session, &broker, text.as_str()).await {
                    tracing::debug!(session_id = %session.id(), error = %e, "Stopping reader");
                    break;
                }
                if session.is_closed() {
                    tracing::debug!(session_id = %session.id(), "Send queue closed, stopping reader");
                    break;
                }
            }
            WsMessage::Close(_) => break,
            // axum answers pings; pongs need no bookkeeping
            _ => {}
        }
    }
}

/// Decode one client frame, apply it, and queue the acknowledgement. A
/// client too slow to take its own ack is treated like any other slow
/// consumer and has its queue closed.
async fn handle_frame(
    session: &Session,
    broker: &BrokerHandle,
    raw: &str,
) -> Result<(), BrokerError> {
    let Some(ack) = dispatch(session, broker, raw).await? else {
        return Ok(());
    };
    match ack.encode() {
        Ok(payload) => {
            if !session.enqueue(Bytes::from(payload)) && session.close() {
                tracing::warn!(session_id = %session.id(), "Send queue full on ack, closing session");
            }
        }
        Err(e) => tracing::error!(session_id = %session.id(), error = %e, "Ack encode failed"),
    }
    Ok(())
}

/// Route a decoded envelope to the broker. Returns the ack to send back, if
/// any. Only a stopped broker is reported as an error.
pub async fn dispatch(
    session: &Session,
    broker: &BrokerHandle,
    raw: &str,
) -> Result<Option<Envelope>, BrokerError> {
    let envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "Invalid envelope");
            return Ok(None);
        }
    };

    if envelope.kind == MessageType::Ack {
        return Ok(None);
    }
    let channel = match envelope.require_channel() {
        Ok(channel) => channel.to_string(),
        Err(e) => return Ok(Some(Envelope::ack(e.to_string()))),
    };

    match envelope.kind {
        MessageType::Join => {
            broker.join(session, channel).await?;
        }
        MessageType::Leave => {
            broker.leave(session, channel).await?;
        }
        MessageType::Message => match broker.broadcast_from(session, envelope).await {
            Ok(report) => {
                if !report.evicted.is_empty() {
                    tracing::info!(
                        channel = %channel,
                        evicted = report.evicted.len(),
                        "Broadcast evicted slow consumers"
                    );
                }
            }
            Err(BrokerError::Stopped) => return Err(BrokerError::Stopped),
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Broadcast dropped");
                return Ok(Some(Envelope::ack(e.to_string())));
            }
        },
        MessageType::Ack => {}
    }

    Ok(Some(Envelope::ack(ACK_RECEIVED)))
}
