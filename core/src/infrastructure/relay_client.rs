// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Peer-side relay session: one authenticated WebSocket carrying JSON frames.
//!
//! The first frame out is always `authenticate`; the session is usable once
//! the relay answers `connection_confirmed` with our peer id.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::domain::message::RelayMessage;
use crate::domain::peer::PeerId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("cannot reach the relay at {url}: {detail}")]
    Connect { url: String, detail: String },
    #[error("relay rejected authentication: {0}")]
    AuthFailed(String),
    #[error("relay protocol violation: {0}")]
    Protocol(String),
    #[error("relay connection closed")]
    Closed,
}

pub struct RelaySession {
    sink: SplitSink<WsStream, WsMessage>,
    stream: SplitStream<WsStream>,
    pub peer_id: PeerId,
}

impl RelaySession {
    /// Dial the relay and complete the authentication handshake.
    pub async fn connect(relay_url: &str, token: &str) -> Result<Self, RelayClientError> {
        let (socket, _) = connect_async(relay_url)
            .await
            .map_err(|e| RelayClientError::Connect {
                url: relay_url.to_string(),
                detail: e.to_string(),
            })?;
        let (mut sink, mut stream) = socket.split();

        let hello = RelayMessage::Authenticate {
            token: token.to_string(),
        };
        sink.send(WsMessage::Text(hello.to_json()))
            .await
            .map_err(|e| RelayClientError::AuthFailed(e.to_string()))?;

        let peer_id = loop {
            match next_frame(&mut stream).await? {
                RelayMessage::ConnectionConfirmed { peer_id } => break peer_id,
                RelayMessage::Error { message } => {
                    return Err(RelayClientError::AuthFailed(message))
                }
                other => {
                    return Err(RelayClientError::Protocol(format!(
                        "expected connection_confirmed, got {:?}",
                        other
                    )))
                }
            }
        };

        debug!(peer = %peer_id, "relay session established");
        Ok(Self {
            sink,
            stream,
            peer_id,
        })
    }

    pub async fn send(&mut self, message: &RelayMessage) -> Result<(), RelayClientError> {
        self.sink
            .send(WsMessage::Text(message.to_json()))
            .await
            .map_err(|_| RelayClientError::Closed)
    }

    /// Next protocol frame, skipping transport-level chatter.
    pub async fn next(&mut self) -> Result<RelayMessage, RelayClientError> {
        next_frame(&mut self.stream).await
    }

    /// Next frame within a deadline; `None` on timeout.
    pub async fn next_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<Option<RelayMessage>, RelayClientError> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn close(mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

async fn next_frame(
    stream: &mut SplitStream<WsStream>,
) -> Result<RelayMessage, RelayClientError> {
    loop {
        let message = stream
            .next()
            .await
            .ok_or(RelayClientError::Closed)?
            .map_err(|_| RelayClientError::Closed)?;

        match message {
            WsMessage::Text(raw) => match RelayMessage::from_json(&raw) {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    warn!("dropping unparseable relay frame: {}", e);
                    continue;
                }
            },
            WsMessage::Close(_) => return Err(RelayClientError::Closed),
            // Pings are answered by the transport layer on the next send.
            _ => continue,
        }
    }
}
