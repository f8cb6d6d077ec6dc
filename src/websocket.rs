//! # Room WebSocket Handler
//!
//! One actor per connection on `/ws/room`. It is the transport boundary of the room server:
//! text frames are decoded once into [`ClientMessage`] and forwarded to the connection's room
//! actor, and the room's outbound [`ServerEvent`]s are streamed back as JSON text frames.
//!
//! ## Connection lifecycle:
//! 1. **Upgrade**: the connection gets a fresh UUID v4 connection id
//! 2. **Join**: `join {displayName, room?}` routes through the [`RoomRegistry`] to the room.
//!    The room queues `joined` and `chatHistory` on this connection's outbox before
//!    anything else can reach it
//! 3. **Session**: voice, speaking, chat and whiteboard messages are relayed through the room
//! 4. **Leave**: explicit `leave`, socket close, heartbeat timeout or protocol failure. All of
//!    them end in the same idempotent room `leave`
//!
//! ## Errors on the wire:
//! Anything the server refuses is answered with `error {code, message}` and the session
//! carries on. Codes: `invalid_message`, `payload_too_large`, `not_joined`,
//! `already_joined`, `invalid_display_name`, `room_full`, `room_unavailable`.
//!
//! [`RoomRegistry`]: crate::server::RoomRegistry

use crate::protocol::{ClientMessage, ConnectionId, RoomId, ServerEvent};
use crate::server::registry::{
    self, Leave, PostChat, RelaySpeaking, RelayVoice, RoomActor, UpdateWhiteboard,
};
use crate::server::{open_and_join, Outbox};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// The room a connection currently belongs to.
struct Membership {
    room_id: RoomId,
    room: Addr<RoomActor>,
}

/// WebSocket session actor for one participant connection.
pub struct RoomWebSocket {
    connection_id: ConnectionId,
    state: AppState,
    membership: Option<Membership>,
    /// Handed to the room on join; the room pushes this connection's events into it
    outbox: Outbox,
    inbox: Option<UnboundedReceiver<Arc<ServerEvent>>>,
    last_heartbeat: Instant,
}

impl RoomWebSocket {
    pub fn new(state: AppState) -> Self {
        let (outbox, inbox) = unbounded_channel();
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            state,
            membership: None,
            outbox,
            inbox: Some(inbox),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(
                connection_id = %self.connection_id,
                kind = event.kind(),
                "Failed to serialize event: {}",
                err
            ),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_event(ctx, &ServerEvent::error(code, message));
    }

    /// Count, log and answer a frame that could not be used.
    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.state.metrics.protocol_error();
        warn!(connection_id = %self.connection_id, code, "Rejected message: {}", message);
        self.send_error(ctx, code, message);
    }

    fn handle_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let ClientMessage::Join { display_name, room } = msg {
            self.handle_join(display_name, room, ctx);
            return;
        }

        let Some(membership) = &self.membership else {
            self.send_error(ctx, "not_joined", "Join a room first");
            return;
        };
        let room = membership.room.clone();
        let connection_id = self.connection_id.clone();

        match msg {
            ClientMessage::Join { .. } => {}
            ClientMessage::Leave => {
                self.leave_room();
            }
            ClientMessage::Voice { payload } => {
                let limit = self.state.config.voice.max_payload_bytes;
                if payload.len() > limit {
                    self.state.metrics.voice_dropped();
                    self.reject(
                        ctx,
                        "payload_too_large",
                        &format!("Voice payload of {} bytes exceeds {}", payload.len(), limit),
                    );
                    return;
                }
                debug!(connection_id = %connection_id, bytes = payload.len(), "Relaying voice frame");
                self.state.metrics.voice_relayed();
                room.do_send(RelayVoice {
                    connection_id,
                    payload,
                });
            }
            ClientMessage::VoiceStart => room.do_send(RelaySpeaking {
                connection_id,
                speaking: true,
            }),
            ClientMessage::VoiceEnd => room.do_send(RelaySpeaking {
                connection_id,
                speaking: false,
            }),
            ClientMessage::WhiteboardImage { image_reference } => {
                if !image_reference.trim().is_empty() {
                    self.state.metrics.whiteboard_updated();
                }
                room.do_send(UpdateWhiteboard {
                    connection_id,
                    image_reference,
                });
            }
            ClientMessage::ChatMessage { text } => {
                if !text.trim().is_empty() {
                    self.state.metrics.chat_posted();
                }
                room.do_send(PostChat { connection_id, text });
            }
        }
    }

    fn handle_join(
        &mut self,
        display_name: String,
        room: Option<RoomId>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if let Some(membership) = &self.membership {
            let message = format!("Already joined room '{}'", membership.room_id);
            self.send_error(ctx, "already_joined", &message);
            return;
        }

        let room_id = room
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.state.config.rooms.default_room.clone());

        let join = registry::Join {
            connection_id: self.connection_id.clone(),
            display_name,
            outbox: self.outbox.clone(),
        };
        let registry = self.state.registry.clone();

        // `wait` holds back every later frame until the join settles, so nothing this
        // connection sends can overtake its own join.
        let fut = open_and_join(registry, room_id.clone(), join)
            .into_actor(self)
            .map(move |result, act, ctx| match result {
                Ok((room, _snapshot)) => {
                    act.state.metrics.joined();
                    info!(connection_id = %act.connection_id, room = %room_id, "Joined room");
                    act.membership = Some(Membership { room_id, room });
                }
                Err(err) => {
                    warn!(
                        connection_id = %act.connection_id,
                        room = %room_id,
                        "Join refused: {}",
                        err
                    );
                    act.send_error(ctx, err.code(), &err.to_string());
                }
            });
        ctx.wait(fut);
    }

    /// Leave the current room, if any. Safe to call repeatedly.
    fn leave_room(&mut self) {
        if let Some(membership) = self.membership.take() {
            info!(
                connection_id = %self.connection_id,
                room = %membership.room_id,
                "Leaving room"
            );
            membership.room.do_send(Leave {
                connection_id: self.connection_id.clone(),
            });
        }
    }
}

impl Actor for RoomWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection started");
        self.state.metrics.connection_opened();

        if let Some(inbox) = self.inbox.take() {
            ctx.add_stream(UnboundedReceiverStream::new(inbox));
        }

        let timeout = self.state.config.client_timeout();
        ctx.run_interval(self.state.config.heartbeat_interval(), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(connection_id = %act.connection_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.leave_room();
        self.state.metrics.connection_closed();
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
    }
}

/// Inbound frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RoomWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.state.metrics.message_received();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        debug!(connection_id = %self.connection_id, kind = message.kind(), "Received message");
                        self.handle_message(message, ctx);
                    }
                    Err(err) => {
                        self.reject(ctx, "invalid_message", &format!("Invalid message: {}", err));
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
                self.state.metrics.message_received();
                self.reject(ctx, "invalid_message", "Binary frames are not supported");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outbound events queued by the room.
impl StreamHandler<Arc<ServerEvent>> for RoomWebSocket {
    fn handle(&mut self, event: Arc<ServerEvent>, ctx: &mut Self::Context) {
        self.send_event(ctx, &event);
    }

    // The actor holds a sender itself, so the stream only ends when the actor does.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// WebSocket endpoint handler for `/ws/room`.
pub async fn room_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    let max_frame_bytes = app_state.config.websocket.max_frame_bytes;
    let session = RoomWebSocket::new(app_state.get_ref().clone());

    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[actix::test]
    async fn test_each_session_gets_a_fresh_uuid() {
        let state = AppState::new(AppConfig::default());
        let a = RoomWebSocket::new(state.clone());
        let b = RoomWebSocket::new(state);

        assert_ne!(a.connection_id(), b.connection_id());
        assert!(uuid::Uuid::parse_str(a.connection_id()).is_ok());
        assert!(a.membership.is_none());
    }
}
