// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-connection WebSocket handling.
//!
//! The first frame on every socket must be `authenticate`; anything else
//! disconnects. After the handshake a writer task drains the peer's outbound
//! queue while the read loop dispatches frames into [`RelayState`]. Ordering
//! is preserved per connection: frames are processed in arrival order.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hokipoki_core::domain::message::RelayMessage;
use hokipoki_core::domain::peer::PeerId;

use crate::auth::TokenValidator;
use crate::state::RelayState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayState>,
    pub validator: Arc<dyn TokenValidator>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // -- handshake: authenticate or be disconnected ------------------------
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await;
    let token = match first {
        Ok(Some(Ok(Message::Text(raw)))) => match RelayMessage::from_json(&raw) {
            Ok(RelayMessage::Authenticate { token }) => token,
            Ok(other) => {
                debug!("first frame was {:?}, disconnecting", other);
                let _ = sink
                    .send(Message::Text(
                        RelayMessage::Error {
                            message: "first frame must be authenticate".into(),
                        }
                        .to_json(),
                    ))
                    .await;
                return;
            }
            Err(_) => return,
        },
        _ => return,
    };

    let user = match state.validator.validate(&token).await {
        Ok(user) => user,
        Err(e) => {
            info!("authentication rejected: {}", e);
            let _ = sink
                .send(Message::Text(
                    RelayMessage::Error {
                        message: format!("authentication failed: {}", e),
                    }
                    .to_json(),
                ))
                .await;
            return;
        }
    };

    let peer_id = PeerId::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayMessage>();
    state.relay.register_peer(peer_id, user.user_id, tx);

    // Writer: everything the relay addresses to this peer, in order.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: dispatch frames until the socket closes.
    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(raw) => match RelayMessage::from_json(&raw) {
                        Ok(frame) => dispatch(&state.relay, peer_id, frame),
                        Err(e) => warn!(peer = %peer_id, "unparseable frame dropped: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    writer.abort();
    state.relay.remove_peer(peer_id);
}

fn dispatch(relay: &RelayState, peer_id: PeerId, frame: RelayMessage) {
    match frame {
        RelayMessage::RegisterProvider { payload } => relay.set_provider(peer_id, payload),
        RelayMessage::RegisterRequester { payload } => relay.set_requester(peer_id, payload),
        RelayMessage::PublishTask { payload } => relay.publish_task(peer_id, payload),
        RelayMessage::AcceptTask { task_id } => relay.accept_task(peer_id, task_id),
        RelayMessage::DeclineTask { task_id } => relay.decline_task(peer_id, task_id),
        // The authenticated socket identity wins over the claimed `from`.
        RelayMessage::P2pRelay { to, payload, .. } => relay.forward_p2p(peer_id, to, payload),
        RelayMessage::CancelTask { task_id, reason } => {
            relay.cancel_task(peer_id, task_id, reason)
        }
        RelayMessage::Authenticate { .. } => {
            debug!(peer = %peer_id, "duplicate authenticate ignored");
        }
        other => {
            warn!(peer = %peer_id, "unexpected frame from peer: {:?}", other);
        }
    }
}
