//! # Room Actors and Registry
//!
//! Each room runs as its own actix actor, so its mailbox is the single queue that orders
//! every join, leave, relay, chat and whiteboard operation for that room. Rooms never share
//! state, so a busy room cannot stall another one.
//!
//! The [`RoomRegistry`] actor owns the room-id → address map. It is started once by the
//! server and handed to connection handlers through [`crate::state::AppState`].
//!
//! ## Room closing:
//! When the last participant leaves, the room waits `idle_close` and stops if it is still
//! empty. A stopped room reports back so the registry forgets it; a join that raced the
//! stop sees a closed mailbox and [`open_and_join`] simply asks the registry again.

use crate::protocol::{ChatMessage, ConnectionId, RoomId, WhiteboardState};
use crate::server::room::{JoinSnapshot, Outbox, Room, RoomError, RoomSummary};
use actix::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many times a join retries when the room it was routed to stopped underneath it.
const OPEN_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Room actor messages
// ---------------------------------------------------------------------------

/// Register a connection in the room.
#[derive(Message, Clone)]
#[rtype(result = "Result<JoinSnapshot, RoomError>")]
pub struct Join {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub outbox: Outbox,
}

/// Remove a connection (explicit leave or dropped socket). Idempotent.
#[derive(Message)]
#[rtype(result = "bool")]
pub struct Leave {
    pub connection_id: ConnectionId,
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct RelayVoice {
    pub connection_id: ConnectionId,
    pub payload: String,
}

/// `voiceStart` when `speaking` is true, `voiceEnd` otherwise.
#[derive(Message)]
#[rtype(result = "bool")]
pub struct RelaySpeaking {
    pub connection_id: ConnectionId,
    pub speaking: bool,
}

#[derive(Message)]
#[rtype(result = "Option<ChatMessage>")]
pub struct PostChat {
    pub connection_id: ConnectionId,
    pub text: String,
}

#[derive(Message)]
#[rtype(result = "Option<WhiteboardState>")]
pub struct UpdateWhiteboard {
    pub connection_id: ConnectionId,
    pub image_reference: String,
}

#[derive(Message)]
#[rtype(result = "RoomSummary")]
pub struct GetSummary;

// ---------------------------------------------------------------------------
// Room actor
// ---------------------------------------------------------------------------

/// Actor wrapper around one [`Room`].
pub struct RoomActor {
    room: Room,
    registry: Addr<RoomRegistry>,
    idle_close: Duration,
    idle_timer: Option<SpawnHandle>,
}

impl RoomActor {
    pub fn new(room: Room, registry: Addr<RoomRegistry>, idle_close: Duration) -> Self {
        Self {
            room,
            registry,
            idle_close,
            idle_timer: None,
        }
    }

    /// Arm the idle timer if the room is empty.
    fn schedule_idle_close(&mut self, ctx: &mut Context<Self>) {
        if !self.room.is_empty() {
            return;
        }
        if let Some(handle) = self.idle_timer.take() {
            ctx.cancel_future(handle);
        }

        let handle = ctx.run_later(self.idle_close, |act, ctx| {
            act.idle_timer = None;
            if act.room.is_empty() {
                info!(room = %act.room.id(), "Room idle, closing");
                ctx.stop();
            }
        });
        self.idle_timer = Some(handle);
    }
}

impl Actor for RoomActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(room = %self.room.id(), "Room opened");
        // A room whose first join fails must not live forever
        self.schedule_idle_close(ctx);
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        info!(
            room = %self.room.id(),
            chat_messages = self.room.chat_log().len(),
            "Room closed"
        );
        self.registry.do_send(RoomClosed {
            room_id: self.room.id().to_string(),
            addr: ctx.address(),
        });
    }
}

impl Handler<Join> for RoomActor {
    type Result = Result<JoinSnapshot, RoomError>;

    fn handle(&mut self, msg: Join, ctx: &mut Self::Context) -> Self::Result {
        let snapshot = self
            .room
            .join(msg.connection_id, &msg.display_name, msg.outbox)?;
        if let Some(handle) = self.idle_timer.take() {
            ctx.cancel_future(handle);
        }
        Ok(snapshot)
    }
}

impl Handler<Leave> for RoomActor {
    type Result = bool;

    fn handle(&mut self, msg: Leave, ctx: &mut Self::Context) -> Self::Result {
        let removed = self.room.leave(&msg.connection_id);
        if removed {
            self.schedule_idle_close(ctx);
        }
        removed
    }
}

impl Handler<RelayVoice> for RoomActor {
    type Result = usize;

    fn handle(&mut self, msg: RelayVoice, _ctx: &mut Self::Context) -> Self::Result {
        self.room.relay_voice(&msg.connection_id, msg.payload)
    }
}

impl Handler<RelaySpeaking> for RoomActor {
    type Result = bool;

    fn handle(&mut self, msg: RelaySpeaking, _ctx: &mut Self::Context) -> Self::Result {
        if msg.speaking {
            self.room.relay_voice_start(&msg.connection_id)
        } else {
            self.room.relay_voice_end(&msg.connection_id)
        }
    }
}

impl Handler<PostChat> for RoomActor {
    type Result = Option<ChatMessage>;

    fn handle(&mut self, msg: PostChat, _ctx: &mut Self::Context) -> Self::Result {
        self.room.post_chat_message(&msg.connection_id, &msg.text)
    }
}

impl Handler<UpdateWhiteboard> for RoomActor {
    type Result = Option<WhiteboardState>;

    fn handle(&mut self, msg: UpdateWhiteboard, _ctx: &mut Self::Context) -> Self::Result {
        self.room
            .update_whiteboard(&msg.connection_id, msg.image_reference)
    }
}

impl Handler<GetSummary> for RoomActor {
    type Result = MessageResult<GetSummary>;

    fn handle(&mut self, _msg: GetSummary, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.room.summary())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Get the room actor for `room_id`, creating the room if needed.
#[derive(Message)]
#[rtype(result = "Addr<RoomActor>")]
pub struct OpenRoom {
    pub room_id: RoomId,
}

/// Sent by a room actor when it stops.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RoomClosed {
    pub room_id: RoomId,
    pub addr: Addr<RoomActor>,
}

/// Summaries of every open room, sorted by room id.
#[derive(Message)]
#[rtype(result = "Vec<RoomSummary>")]
pub struct ListRooms;

/// Process-wide directory of open rooms.
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Addr<RoomActor>>,
    max_participants: usize,
    idle_close: Duration,
}

impl RoomRegistry {
    pub fn new(max_participants: usize, idle_close: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            max_participants,
            idle_close,
        }
    }
}

impl Actor for RoomRegistry {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!(
            max_participants = self.max_participants,
            idle_close_secs = self.idle_close.as_secs(),
            "Room registry started"
        );
    }
}

impl Handler<OpenRoom> for RoomRegistry {
    type Result = MessageResult<OpenRoom>;

    fn handle(&mut self, msg: OpenRoom, ctx: &mut Self::Context) -> Self::Result {
        if let Some(addr) = self.rooms.get(&msg.room_id) {
            if addr.connected() {
                return MessageResult(addr.clone());
            }
        }

        let room = Room::new(msg.room_id.clone(), self.max_participants);
        let addr = RoomActor::new(room, ctx.address(), self.idle_close).start();
        self.rooms.insert(msg.room_id, addr.clone());
        MessageResult(addr)
    }
}

impl Handler<RoomClosed> for RoomRegistry {
    type Result = ();

    fn handle(&mut self, msg: RoomClosed, _ctx: &mut Self::Context) {
        // A newer actor may already serve this id
        if self.rooms.get(&msg.room_id) == Some(&msg.addr) {
            self.rooms.remove(&msg.room_id);
            debug!(room = %msg.room_id, open_rooms = self.rooms.len(), "Room forgotten");
        }
    }
}

impl Handler<ListRooms> for RoomRegistry {
    type Result = ResponseFuture<Vec<RoomSummary>>;

    fn handle(&mut self, _msg: ListRooms, _ctx: &mut Self::Context) -> Self::Result {
        let rooms: Vec<Addr<RoomActor>> = self.rooms.values().cloned().collect();

        Box::pin(async move {
            let results =
                futures_util::future::join_all(rooms.iter().map(|room| room.send(GetSummary)))
                    .await;
            let mut summaries: Vec<RoomSummary> =
                results.into_iter().filter_map(Result::ok).collect();
            summaries.sort_by(|a, b| a.room.cmp(&b.room));
            summaries
        })
    }
}

// ---------------------------------------------------------------------------
// Join helper
// ---------------------------------------------------------------------------

/// Why [`open_and_join`] failed.
#[derive(Debug)]
pub enum JoinError {
    /// The room refused the participant
    Rejected(RoomError),
    /// Registry or room mailbox unreachable
    Unavailable(MailboxError),
}

impl JoinError {
    pub fn code(&self) -> &'static str {
        match self {
            JoinError::Rejected(err) => err.code(),
            JoinError::Unavailable(_) => "room_unavailable",
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Rejected(err) => write!(f, "{}", err),
            JoinError::Unavailable(err) => write!(f, "Room unavailable: {}", err),
        }
    }
}

/// Route a join through the registry to the room actor.
///
/// Retries when the room stopped between lookup and delivery.
pub async fn open_and_join(
    registry: Addr<RoomRegistry>,
    room_id: RoomId,
    join: Join,
) -> Result<(Addr<RoomActor>, JoinSnapshot), JoinError> {
    let mut last_error = MailboxError::Closed;

    for attempt in 1..=OPEN_ATTEMPTS {
        let room = registry
            .send(OpenRoom {
                room_id: room_id.clone(),
            })
            .await
            .map_err(JoinError::Unavailable)?;

        match room.send(join.clone()).await {
            Ok(Ok(snapshot)) => return Ok((room, snapshot)),
            Ok(Err(err)) => return Err(JoinError::Rejected(err)),
            Err(err) => {
                warn!(room = %room_id, attempt, "Room stopped during join, reopening");
                last_error = err;
            }
        }
    }

    Err(JoinError::Unavailable(last_error))
}
