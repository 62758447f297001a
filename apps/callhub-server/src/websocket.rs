use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::ChatRelay;
use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::media::MediaControl;
use crate::registry::{JoinRequest, RoomRegistry};
use crate::relay::{SignalEnvelope, SignalRelay};
use crate::room::Outbox;
use crate::screen_share::ScreenShareNegotiator;
use crate::signaling::{generate_participant_id, ClientMessage, Role, ServerMessage};

/// Shared handles every connection dispatches into
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistry,
    pub relay: SignalRelay,
    pub media: MediaControl,
    pub screen_share: ScreenShareNegotiator,
    pub chat: ChatRelay,
    connections: Arc<AtomicI64>,
}

impl SignalingState {
    pub fn new(config: &Config) -> Self {
        let registry = RoomRegistry::new(config.join_limits());
        Self {
            relay: SignalRelay::new(registry.clone()),
            media: MediaControl::new(registry.clone()),
            screen_share: ScreenShareNegotiator::new(registry.clone()),
            chat: ChatRelay::new(registry.clone(), config.max_chat_len),
            registry,
            connections: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn open_connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) {
        let open = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("callhub_connections_open", open as f64);
    }

    fn connection_closed(&self) {
        let open = self.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("callhub_connections_open", open as f64);
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(signaling): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, signaling, remote_addr))
}

/// Drive one client connection. The connection id doubles as the participant
/// id for whatever room the client joins.
async fn handle_socket(socket: WebSocket, state: SignalingState, remote_addr: SocketAddr) {
    let participant_id = generate_participant_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.connection_opened();

    let writer_id = participant_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(participant_id = %writer_id, error = %err, "failed to encode message"),
            }
        }
        debug!(participant_id = %writer_id, "writer task ended");
    });

    info!(participant_id = %participant_id, remote_addr = %remote_addr, "connection opened");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(participant_id = %participant_id, error = %err, "websocket error");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(participant_id = %participant_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => dispatch(message, &participant_id, &state, &tx),
            Err(err) => {
                counter!("callhub_malformed_frames_total", 1);
                debug!(participant_id = %participant_id, error = %err, "malformed client message");
                let _ = tx.send(malformed_reply(&text, &err));
            }
        }
    }

    state.registry.connection_lost(&participant_id);
    state.connection_closed();
    drop(tx);
    let _ = writer.await;
    info!(participant_id = %participant_id, "connection closed");
}

/// Reply to a frame that did not decode. A frame that still names
/// `join-room` gets a `join-error` so the joining client sees it.
fn malformed_reply(text: &str, err: &serde_json::Error) -> ServerMessage {
    let err = SessionError::invalid(format!("malformed message: {err}"));
    let is_join = serde_json::from_str::<serde_json::Value>(text)
        .map(|value| value["type"] == "join-room")
        .unwrap_or(false);
    if is_join {
        ServerMessage::JoinError {
            code: err.code(),
            reason: err.to_string(),
        }
    } else {
        ServerMessage::error(&err)
    }
}

/// Run one client message and report any failure to the acting client only.
fn dispatch(message: ClientMessage, participant_id: &str, state: &SignalingState, tx: &Outbox) {
    let kind = message.kind();
    let is_join = matches!(message, ClientMessage::JoinRoom { .. });
    if let Err(err) = handle_client_message(message, participant_id, state, tx) {
        debug!(
            participant_id = %participant_id,
            kind,
            code = err.metric_label(),
            error = %err,
            "client request failed"
        );
        let reply = if is_join {
            ServerMessage::JoinError {
                code: err.code(),
                reason: err.to_string(),
            }
        } else {
            ServerMessage::error(&err)
        };
        let _ = tx.send(reply);
    }
}

fn handle_client_message(
    message: ClientMessage,
    participant_id: &str,
    state: &SignalingState,
    tx: &Outbox,
) -> SessionResult<()> {
    match message {
        ClientMessage::JoinRoom {
            room_id,
            display_name,
            role,
        } => {
            let role: Role = role.parse()?;
            state.registry.join(
                participant_id,
                tx.clone(),
                JoinRequest {
                    room_id,
                    display_name,
                    role,
                },
            )?;
        }

        ClientMessage::LeaveRoom => {
            // Leaving twice is a no-op, never an error.
            state.registry.leave(participant_id);
        }

        ClientMessage::ListParticipants => {
            let snapshot = state.registry.snapshot_for(participant_id)?;
            let _ = tx.send(ServerMessage::Participants {
                participants: snapshot.participants,
                admin_id: snapshot.admin_id,
            });
        }

        ClientMessage::ChatMessage { text } => {
            state.chat.post(participant_id, &text)?;
        }

        ClientMessage::Signal {
            channel,
            target_id,
            payload,
        } => {
            state.relay.route(
                participant_id,
                SignalEnvelope {
                    channel,
                    target_id,
                    payload,
                },
            )?;
        }

        ClientMessage::SetOwnMic { enabled } => {
            state.media.set_own_mic(participant_id, enabled)?;
        }

        ClientMessage::SetUserMic { target_id, enabled } => {
            state.media.set_user_mic(participant_id, &target_id, enabled)?;
        }

        ClientMessage::ReportMicState { enabled } => {
            state.media.report_mic_state(participant_id, enabled)?;
        }

        ClientMessage::RequestScreenShare { target_id } => {
            state.screen_share.request(participant_id, &target_id)?;
        }

        ClientMessage::AcceptScreenShare => {
            state.screen_share.accept(participant_id)?;
        }

        ClientMessage::RejectScreenShare => {
            state.screen_share.reject(participant_id)?;
        }

        ClientMessage::StopScreenShare { target_id } => {
            state
                .screen_share
                .stop(participant_id, target_id.as_deref())?;
        }

        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
    Ok(())
}
