//! # Room State
//!
//! The authoritative state of one collaboration room: who is in it, the chat log, and the
//! whiteboard. Every operation is a plain synchronous method; the actor in
//! [`crate::server::registry`] feeds them one at a time, which is the only serialization
//! a room needs.
//!
//! ## Room Lifecycle:
//! 1. **Open**: created on the first join for its id
//! 2. **Active**: participants join, leave, talk, chat and draw
//! 3. **Idle**: last participant left, chat log and whiteboard still retained
//! 4. **Closed**: the idle window elapsed, everything is dropped
//!
//! ## Fan-out:
//! Each member owns an unbounded outbound queue ([`Outbox`]). Events are pushed in the order
//! the room produces them, so per-member delivery order equals room processing order.

use crate::protocol::{ChatMessage, ConnectionId, ParticipantInfo, RoomId, ServerEvent, WhiteboardState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// Outbound event queue of one connection.
///
/// Events are shared behind an `Arc` so a voice frame fanned out to thirty peers is
/// allocated once.
pub type Outbox = UnboundedSender<Arc<ServerEvent>>;

/// Reasons a join is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Display name was empty or whitespace
    EmptyDisplayName,
    /// This connection is already a member
    AlreadyJoined,
    /// Room reached its participant cap
    RoomFull(usize),
}

impl RoomError {
    /// Machine-readable code sent in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::EmptyDisplayName => "invalid_display_name",
            RoomError::AlreadyJoined => "already_joined",
            RoomError::RoomFull(_) => "room_full",
        }
    }
}

impl fmt::Display for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomError::EmptyDisplayName => write!(f, "Display name must not be empty"),
            RoomError::AlreadyJoined => write!(f, "Connection has already joined this room"),
            RoomError::RoomFull(max) => write!(f, "Room is full ({} participants)", max),
        }
    }
}

impl std::error::Error for RoomError {}

/// What a successful join hands back to the caller.
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    /// Membership in join order, including the new participant
    pub participants: Vec<ParticipantInfo>,
    /// Every chat message posted so far, in post order
    pub chat_history: Vec<ChatMessage>,
    /// Current whiteboard, replayed to late joiners
    pub whiteboard: Option<WhiteboardState>,
}

/// Summary of a room for the REST API.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room: RoomId,
    pub participant_count: usize,
    pub chat_messages: usize,
    pub has_whiteboard: bool,
    pub created_at: DateTime<Utc>,
}

struct Member {
    info: ParticipantInfo,
    outbox: Outbox,
}

/// One room: participants, chat log and whiteboard.
///
/// ## Invariants:
/// - A connection id appears at most once in `members`
/// - `chat_log` is append-only
/// - `whiteboard` only ever changes through [`Room::update_whiteboard`]
pub struct Room {
    id: RoomId,

    /// Members in join order
    members: Vec<Member>,

    chat_log: Vec<ChatMessage>,

    whiteboard: Option<WhiteboardState>,

    /// Maximum number of simultaneous members
    max_participants: usize,

    created_at: DateTime<Utc>,
}

impl Room {
    /// Create an empty room.
    pub fn new(id: impl Into<RoomId>, max_participants: usize) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            chat_log: Vec::new(),
            whiteboard: None,
            max_participants,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a participant.
    ///
    /// ## What this does:
    /// 1. Validates the display name and the participant cap
    /// 2. Adds the member with its outbound queue
    /// 3. Queues `joined` and then `chatHistory` to the caller, before anything else can
    ///    reach its queue
    /// 4. Broadcasts `participantJoined` to every other member
    ///
    /// ## Returns:
    /// - **Ok(snapshot)**: membership, full chat log and current whiteboard
    /// - **Err(RoomError)**: nothing changed and nothing was broadcast
    pub fn join(
        &mut self,
        connection_id: ConnectionId,
        display_name: &str,
        outbox: Outbox,
    ) -> Result<JoinSnapshot, RoomError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(RoomError::EmptyDisplayName);
        }
        if self.contains(&connection_id) {
            return Err(RoomError::AlreadyJoined);
        }
        if self.members.len() >= self.max_participants {
            return Err(RoomError::RoomFull(self.max_participants));
        }

        let info = ParticipantInfo {
            connection_id: connection_id.clone(),
            display_name: display_name.to_string(),
            is_speaking: false,
            joined_at: Utc::now(),
        };
        self.members.push(Member {
            info: info.clone(),
            outbox,
        });

        let snapshot = JoinSnapshot {
            participants: self.participants(),
            chat_history: self.chat_log.clone(),
            whiteboard: self.whiteboard.clone(),
        };

        self.send_to(
            &connection_id,
            ServerEvent::Joined {
                connection_id: connection_id.clone(),
                room: self.id.clone(),
                participants: snapshot.participants.clone(),
                whiteboard: snapshot.whiteboard.clone(),
            },
        );
        self.send_to(
            &connection_id,
            ServerEvent::ChatHistory {
                messages: snapshot.chat_history.clone(),
            },
        );
        self.broadcast(
            ServerEvent::ParticipantJoined { participant: info },
            Some(&connection_id),
        );

        info!(
            room = %self.id,
            connection_id = %connection_id,
            display_name = %display_name,
            participants = self.members.len(),
            "Participant joined"
        );
        Ok(snapshot)
    }

    /// Remove a participant and broadcast `participantLeft`.
    ///
    /// Idempotent: returns `false` and broadcasts nothing when the connection is not a member.
    pub fn leave(&mut self, connection_id: &str) -> bool {
        let Some(index) = self.position(connection_id) else {
            return false;
        };
        self.members.remove(index);

        self.broadcast(
            ServerEvent::ParticipantLeft {
                connection_id: connection_id.to_string(),
            },
            None,
        );

        info!(
            room = %self.id,
            connection_id = %connection_id,
            participants = self.members.len(),
            "Participant left"
        );
        true
    }

    /// Relay a voice frame verbatim to everyone except the sender.
    ///
    /// Returns the number of recipients. Frames from non-members are dropped.
    pub fn relay_voice(&self, sender: &str, payload: String) -> usize {
        if !self.contains(sender) {
            return 0;
        }
        let delivered = self.broadcast(
            ServerEvent::Voice {
                sender_connection_id: sender.to_string(),
                payload,
            },
            Some(sender),
        );
        debug!(room = %self.id, sender = %sender, recipients = delivered, "Relayed voice frame");
        delivered
    }

    /// Mark the sender as speaking and tell the others.
    pub fn relay_voice_start(&mut self, connection_id: &str) -> bool {
        self.set_speaking(connection_id, true)
    }

    /// Mark the sender as silent and tell the others.
    pub fn relay_voice_end(&mut self, connection_id: &str) -> bool {
        self.set_speaking(connection_id, false)
    }

    fn set_speaking(&mut self, connection_id: &str, speaking: bool) -> bool {
        let Some(index) = self.position(connection_id) else {
            return false;
        };
        self.members[index].info.is_speaking = speaking;

        let event = if speaking {
            ServerEvent::ParticipantVoiceStart {
                connection_id: connection_id.to_string(),
            }
        } else {
            ServerEvent::ParticipantVoiceEnd {
                connection_id: connection_id.to_string(),
            }
        };
        self.broadcast(event, Some(connection_id));
        true
    }

    /// Append a chat message and broadcast it to everyone, sender included.
    ///
    /// Empty (whitespace-only) text and non-members are ignored.
    pub fn post_chat_message(&mut self, connection_id: &str, text: &str) -> Option<ChatMessage> {
        if text.trim().is_empty() {
            return None;
        }
        let index = self.position(connection_id)?;

        let message = ChatMessage {
            sender_display_name: self.members[index].info.display_name.clone(),
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        self.chat_log.push(message.clone());
        self.broadcast(ServerEvent::ChatMessage(message.clone()), None);

        debug!(room = %self.id, log_len = self.chat_log.len(), "Chat message posted");
        Some(message)
    }

    /// Overwrite the whiteboard and broadcast the new value to everyone.
    ///
    /// Last writer wins. Blank references and non-members are ignored.
    pub fn update_whiteboard(
        &mut self,
        connection_id: &str,
        image_reference: String,
    ) -> Option<WhiteboardState> {
        if image_reference.trim().is_empty() || !self.contains(connection_id) {
            return None;
        }

        let state = WhiteboardState {
            image_reference,
            updated_by: connection_id.to_string(),
            updated_at: Utc::now(),
        };
        self.whiteboard = Some(state.clone());
        self.broadcast(ServerEvent::WhiteboardUpdate(state.clone()), None);

        debug!(room = %self.id, updated_by = %connection_id, "Whiteboard updated");
        Some(state)
    }

    /// Membership snapshot in join order.
    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.members.iter().map(|m| m.info.clone()).collect()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.position(connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.chat_log
    }

    pub fn whiteboard(&self) -> Option<&WhiteboardState> {
        self.whiteboard.as_ref()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room: self.id.clone(),
            participant_count: self.members.len(),
            chat_messages: self.chat_log.len(),
            has_whiteboard: self.whiteboard.is_some(),
            created_at: self.created_at,
        }
    }

    fn position(&self, connection_id: &str) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.info.connection_id == connection_id)
    }

    fn send_to(&self, connection_id: &str, event: ServerEvent) {
        if let Some(index) = self.position(connection_id) {
            if self.members[index].outbox.send(Arc::new(event)).is_err() {
                debug!(connection_id = %connection_id, "Outbox closed, event dropped");
            }
        }
    }

    /// Push `event` to every member except `except`. Returns how many queues accepted it.
    ///
    /// A closed queue belongs to a connection that is already shutting down; its own
    /// leave will arrive through the mailbox, so it is simply skipped here.
    fn broadcast(&self, event: ServerEvent, except: Option<&str>) -> usize {
        let event = Arc::new(event);
        self.members
            .iter()
            .filter(|m| Some(m.info.connection_id.as_str()) != except)
            .filter(|m| m.outbox.send(Arc::clone(&event)).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    type Inbox = UnboundedReceiver<Arc<ServerEvent>>;

    fn join(room: &mut Room, id: &str, name: &str) -> Inbox {
        let (tx, rx) = unbounded_channel();
        room.join(id.to_string(), name, tx).unwrap();
        rx
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    fn chat_texts(events: &[ServerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ChatMessage(m) => Some(m.text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_join_snapshot_and_presence_broadcast() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        drain(&mut alice);

        let (tx, mut bob) = unbounded_channel();
        let snapshot = room.join("b".to_string(), "  Bob ", tx).unwrap();
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(snapshot.participants[1].display_name, "Bob");

        // Caller gets joined then chatHistory, nothing else
        let bob_events = drain(&mut bob);
        assert_eq!(bob_events.len(), 2);
        assert!(matches!(&bob_events[0], ServerEvent::Joined { connection_id, participants, .. }
            if connection_id == "b" && participants.len() == 2));
        assert!(matches!(&bob_events[1], ServerEvent::ChatHistory { messages } if messages.is_empty()));

        // Others get participantJoined
        let alice_events = drain(&mut alice);
        assert_eq!(alice_events.len(), 1);
        assert!(matches!(&alice_events[0], ServerEvent::ParticipantJoined { participant }
            if participant.connection_id == "b"));
    }

    #[test]
    fn test_empty_display_name_is_rejected() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        drain(&mut alice);

        let (tx, mut rx) = unbounded_channel();
        assert_eq!(
            room.join("x".to_string(), "   ", tx).unwrap_err(),
            RoomError::EmptyDisplayName
        );
        assert_eq!(room.len(), 1);
        assert!(drain(&mut rx).is_empty());
        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn test_double_join_and_room_full() {
        let mut room = Room::new("r", 2);
        let _a = join(&mut room, "a", "Alice");

        let (tx, _rx) = unbounded_channel();
        assert_eq!(
            room.join("a".to_string(), "Alice", tx).unwrap_err(),
            RoomError::AlreadyJoined
        );

        let _b = join(&mut room, "b", "Bob");
        let (tx, _rx) = unbounded_channel();
        assert_eq!(
            room.join("c".to_string(), "Carol", tx).unwrap_err(),
            RoomError::RoomFull(2)
        );
        assert_eq!(room.len(), 2);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        let _bob = join(&mut room, "b", "Bob");
        drain(&mut alice);

        assert!(room.leave("b"));
        assert!(!room.leave("b"));
        assert!(!room.leave("never-joined"));

        let left: Vec<_> = drain(&mut alice)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ParticipantLeft { .. }))
            .collect();
        assert_eq!(left.len(), 1);
        assert_eq!(room.len(), 1);
    }

    #[test]
    fn test_membership_matches_joined_minus_left() {
        // Deterministic pseudo-random walk over join/leave, checked against a model set
        let mut room = Room::new("r", 64);
        let mut model = BTreeSet::new();
        let mut inboxes = Vec::new();
        let mut seed: u32 = 0x2545_f491;

        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let id = format!("c{}", (seed >> 16) % 12);
            if (seed >> 8) % 3 == 0 {
                assert_eq!(room.leave(&id), model.remove(&id));
            } else {
                let (tx, rx) = unbounded_channel();
                let joined = room.join(id.clone(), "someone", tx).is_ok();
                assert_eq!(joined, model.insert(id.clone()));
                inboxes.push(rx);
            }

            let actual: BTreeSet<_> = room
                .participants()
                .into_iter()
                .map(|p| p.connection_id)
                .collect();
            assert_eq!(actual, model);
        }
    }

    #[test]
    fn test_chat_history_replay_is_prefix_consistent() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        let mut bob = join(&mut room, "b", "Bob");

        room.post_chat_message("a", "hi");
        room.post_chat_message("b", "hello");

        let mut carol = join(&mut room, "c", "Carol");
        room.post_chat_message("a", "welcome");

        let carol_events = drain(&mut carol);
        match &carol_events[1] {
            ServerEvent::ChatHistory { messages } => {
                let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, vec!["hi", "hello"]);
                assert_eq!(messages[0].sender_display_name, "Alice");
            }
            other => panic!("expected chatHistory, got {:?}", other),
        }
        // Live message N+1 arrives after the replay
        assert_eq!(chat_texts(&carol_events[2..]), vec!["welcome"]);

        // Senders see each of their messages exactly once
        assert_eq!(chat_texts(&drain(&mut alice)), vec!["hi", "hello", "welcome"]);
        assert_eq!(chat_texts(&drain(&mut bob)), vec!["hi", "hello", "welcome"]);
    }

    #[test]
    fn test_empty_chat_is_ignored() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        drain(&mut alice);

        assert!(room.post_chat_message("a", "").is_none());
        assert!(room.post_chat_message("a", "  \n").is_none());
        assert!(room.post_chat_message("ghost", "boo").is_none());
        assert!(room.chat_log().is_empty());
        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn test_voice_is_relayed_to_others_verbatim() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        let mut bob = join(&mut room, "b", "Bob");
        let mut carol = join(&mut room, "c", "Carol");
        drain(&mut alice);
        drain(&mut bob);
        drain(&mut carol);

        assert_eq!(room.relay_voice("a", "AAEC".to_string()), 2);
        assert!(drain(&mut alice).is_empty());
        for inbox in [&mut bob, &mut carol] {
            assert_eq!(
                drain(inbox),
                vec![ServerEvent::Voice {
                    sender_connection_id: "a".to_string(),
                    payload: "AAEC".to_string()
                }]
            );
        }

        assert_eq!(room.relay_voice("ghost", "AAEC".to_string()), 0);
    }

    #[test]
    fn test_speaking_flags_follow_voice_start_and_end() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        let mut bob = join(&mut room, "b", "Bob");
        drain(&mut alice);
        drain(&mut bob);

        assert!(room.relay_voice_start("a"));
        assert!(room.participants()[0].is_speaking);
        assert_eq!(
            drain(&mut bob),
            vec![ServerEvent::ParticipantVoiceStart {
                connection_id: "a".to_string()
            }]
        );
        assert!(drain(&mut alice).is_empty());

        assert!(room.relay_voice_end("a"));
        assert!(!room.participants()[0].is_speaking);
        assert!(!room.relay_voice_start("ghost"));
    }

    #[test]
    fn test_whiteboard_last_write_wins_and_replays_to_late_joiner() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        let mut bob = join(&mut room, "b", "Bob");
        drain(&mut alice);
        drain(&mut bob);

        room.update_whiteboard("a", "image-A".to_string());
        room.update_whiteboard("a", "image-B".to_string());
        assert!(room.update_whiteboard("a", String::new()).is_none());

        for inbox in [&mut alice, &mut bob] {
            let last = drain(inbox)
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::WhiteboardUpdate(state) => Some(state.image_reference),
                    _ => None,
                })
                .last();
            assert_eq!(last.as_deref(), Some("image-B"));
        }

        let mut carol = join(&mut room, "c", "Carol");
        match &drain(&mut carol)[0] {
            ServerEvent::Joined { whiteboard: Some(state), .. } => {
                assert_eq!(state.image_reference, "image-B");
                assert_eq!(state.updated_by, "a");
            }
            other => panic!("expected joined with whiteboard, got {:?}", other),
        }
    }

    #[test]
    fn test_blank_whiteboard_reference_is_ignored() {
        let mut room = Room::new("r", 8);
        let mut alice = join(&mut room, "a", "Alice");
        drain(&mut alice);

        room.update_whiteboard("a", "image-A".to_string());
        drain(&mut alice);

        assert!(room.update_whiteboard("a", "   ".to_string()).is_none());
        assert!(room.update_whiteboard("a", "\n\t".to_string()).is_none());
        assert!(drain(&mut alice).is_empty());
        assert!(room.summary().has_whiteboard);

        let mut bob = join(&mut room, "b", "Bob");
        match &drain(&mut bob)[0] {
            ServerEvent::Joined { whiteboard: Some(state), .. } => {
                assert_eq!(state.image_reference, "image-A")
            }
            other => panic!("expected joined with whiteboard, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_outbox_does_not_break_fan_out() {
        let mut room = Room::new("r", 8);
        let alice = join(&mut room, "a", "Alice");
        let mut bob = join(&mut room, "b", "Bob");
        drain(&mut bob);
        drop(alice);

        room.post_chat_message("b", "still here");
        assert_eq!(chat_texts(&drain(&mut bob)), vec!["still here"]);
    }
}
