//! axum WebSocket adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use super::{FrameReceiver, FrameSender};
use crate::error::TransportError;

/// Split an upgraded socket into relay halves sharing one connected flag.
pub fn split(socket: WebSocket) -> (WsSender, WsReceiver) {
    let (sink, stream) = socket.split();
    let connected = Arc::new(AtomicBool::new(true));
    (
        WsSender {
            sink,
            connected: Arc::clone(&connected),
        },
        WsReceiver { stream, connected },
    )
}

pub struct WsSender {
    sink: SplitSink<WebSocket, Message>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSender for WsSender {
    async fn send_bytes(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        if let Err(e) = self.sink.send(Message::Binary(payload.into())).await {
            self.connected.store(false, Ordering::Release);
            return Err(TransportError::WebSocket(e.to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

pub struct WsReceiver {
    stream: SplitStream<WebSocket>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl FrameReceiver for WsReceiver {
    async fn receive_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        tracing::warn!(len = bytes.len(), "Ignoring non-UTF-8 binary frame");
                    }
                },
                // axum answers pings itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "Peer sent close frame");
                    self.connected.store(false, Ordering::Release);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(TransportError::WebSocket(e.to_string()));
                }
                None => {
                    self.connected.store(false, Ordering::Release);
                    return Ok(None);
                }
            }
        }
    }
}
