//! # Session Mirror
//!
//! The client's read-only replica of its room: membership, chat log, whiteboard, who is
//! speaking, and the per-peer playback pipelines. It changes only through server events
//! (plus the local participant's own speaking state), and every change is reported as a
//! [`ClientEvent`] for the UI.
//!
//! Keeping playback inside the mirror ties pipeline teardown to the same `participantLeft`
//! that removes the participant, so the two can never drift apart.

use crate::audio::PlaybackPipelines;
use crate::client::speaking::SpeakingTracker;
use crate::client::whiteboard::WhiteboardMirror;
use crate::error::ClientError;
use crate::protocol::{ChatMessage, ConnectionId, ParticipantInfo, RoomId, ServerEvent};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What the presentation layer reads once per render tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationState {
    pub speaking_connection_ids: Vec<ConnectionId>,
    pub whiteboard_image_reference: Option<String>,
}

/// Notifications from a session client to whatever drives it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Joined {
        connection_id: ConnectionId,
        room: RoomId,
        participants: Vec<ParticipantInfo>,
    },
    /// Full chat log replay; replaces anything shown before
    ChatHistory(Vec<ChatMessage>),
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft {
        connection_id: ConnectionId,
        display_name: Option<String>,
    },
    ChatMessage(ChatMessage),
    WhiteboardChanged {
        image_reference: String,
        updated_by: ConnectionId,
    },
    SpeakingChanged {
        connection_id: ConnectionId,
        speaking: bool,
    },
    /// `error` event from the server
    ServerError { code: String, message: String },
    /// Isolated local failure (bad frame, device); the session continues
    Error(ClientError),
    Reconnecting { attempt: u32, delay: Duration },
    /// Gave up reconnecting, or the join was refused
    Disconnected { reason: String },
    /// User-initiated leave completed
    Left,
}

pub struct SessionMirror {
    connection_id: Option<ConnectionId>,
    room: Option<RoomId>,
    participants: Vec<ParticipantInfo>,
    chat: Vec<ChatMessage>,
    whiteboard: WhiteboardMirror,
    speaking: SpeakingTracker,
    playback: PlaybackPipelines,
}

impl SessionMirror {
    pub fn new(speaking: SpeakingTracker, playback: PlaybackPipelines) -> Self {
        Self {
            connection_id: None,
            room: None,
            participants: Vec::new(),
            chat: Vec::new(),
            whiteboard: WhiteboardMirror::default(),
            speaking,
            playback,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.connection_id.is_some()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.chat
    }

    pub fn whiteboard(&self) -> &WhiteboardMirror {
        &self.whiteboard
    }

    pub fn playback(&self) -> &PlaybackPipelines {
        &self.playback
    }

    pub fn presentation(&self) -> PresentationState {
        PresentationState {
            speaking_connection_ids: self.speaking.speaking_ids(),
            whiteboard_image_reference: self.whiteboard.image_reference().map(str::to_string),
        }
    }

    /// Apply one server event.
    pub fn apply(&mut self, event: ServerEvent, now: Instant) -> Vec<ClientEvent> {
        let mut events = Vec::new();

        match event {
            ServerEvent::Joined {
                connection_id,
                room,
                participants,
                whiteboard,
            } => {
                self.teardown();
                self.chat.clear();
                self.whiteboard.reset(whiteboard);
                for participant in &participants {
                    if participant.is_speaking {
                        self.speaking.voice_start(&participant.connection_id, now);
                    }
                }
                self.participants = participants.clone();
                self.connection_id = Some(connection_id.clone());
                self.room = Some(room.clone());
                events.push(ClientEvent::Joined {
                    connection_id,
                    room,
                    participants,
                });
            }
            ServerEvent::ChatHistory { messages } => {
                self.chat = messages.clone();
                events.push(ClientEvent::ChatHistory(messages));
            }
            ServerEvent::ParticipantJoined { participant } => {
                self.participants
                    .retain(|p| p.connection_id != participant.connection_id);
                self.participants.push(participant.clone());
                events.push(ClientEvent::ParticipantJoined(participant));
            }
            ServerEvent::ParticipantLeft { connection_id } => {
                let position = self
                    .participants
                    .iter()
                    .position(|p| p.connection_id == connection_id);
                let display_name = position.map(|pos| self.participants.remove(pos).display_name);

                if self.speaking.forget(&connection_id) {
                    events.push(ClientEvent::SpeakingChanged {
                        connection_id: connection_id.clone(),
                        speaking: false,
                    });
                }
                self.playback.remove_peer(&connection_id);
                events.push(ClientEvent::ParticipantLeft {
                    connection_id,
                    display_name,
                });
            }
            ServerEvent::Voice {
                sender_connection_id,
                payload,
            } => {
                if self.connection_id.as_deref() == Some(sender_connection_id.as_str()) {
                    debug!("Ignoring echo of own voice frame");
                } else if let Err(err) = self.playback.handle_frame(&sender_connection_id, &payload)
                {
                    warn!(peer = %sender_connection_id, "Dropped voice frame: {}", err);
                    events.push(ClientEvent::Error(err));
                }
            }
            ServerEvent::ParticipantVoiceStart { connection_id } => {
                if self.speaking.voice_start(&connection_id, now) {
                    self.set_flag(&connection_id, true);
                    events.push(ClientEvent::SpeakingChanged {
                        connection_id,
                        speaking: true,
                    });
                }
            }
            ServerEvent::ParticipantVoiceEnd { connection_id } => {
                self.speaking.voice_end(&connection_id, now);
            }
            ServerEvent::WhiteboardUpdate(state) => {
                let image_reference = state.image_reference.clone();
                let updated_by = state.updated_by.clone();
                if self.whiteboard.apply(state) {
                    events.push(ClientEvent::WhiteboardChanged {
                        image_reference,
                        updated_by,
                    });
                }
            }
            ServerEvent::ChatMessage(message) => {
                self.chat.push(message.clone());
                events.push(ClientEvent::ChatMessage(message));
            }
            ServerEvent::Error { code, message } => {
                events.push(ClientEvent::ServerError { code, message });
            }
        }

        events
    }

    /// Expire speaking deadlines.
    pub fn tick(&mut self, now: Instant) -> Vec<ClientEvent> {
        self.speaking
            .tick(now)
            .into_iter()
            .map(|connection_id| {
                self.set_flag(&connection_id, false);
                ClientEvent::SpeakingChanged {
                    connection_id,
                    speaking: false,
                }
            })
            .collect()
    }

    /// The local participant's own voiceStart, applied without a server round trip.
    pub fn local_voice_start(&mut self, now: Instant) -> Option<ClientEvent> {
        let id = self.connection_id.clone()?;
        if self.speaking.voice_start(&id, now) {
            self.set_flag(&id, true);
            return Some(ClientEvent::SpeakingChanged {
                connection_id: id,
                speaking: true,
            });
        }
        None
    }

    pub fn local_voice_end(&mut self, now: Instant) {
        if let Some(id) = &self.connection_id {
            self.speaking.voice_end(id, now);
        }
    }

    pub fn set_peer_gain(&mut self, peer: &str, gain: f32) -> f32 {
        self.playback.set_gain(peer, gain)
    }

    /// Drop everything tied to the live connection: playback pipelines and speaking state.
    /// Membership and chat stay visible until the next `joined` replaces them.
    pub fn teardown(&mut self) {
        self.playback.clear();
        self.speaking.clear();
        for participant in &mut self.participants {
            participant.is_speaking = false;
        }
        self.connection_id = None;
    }

    /// Forget the room entirely (user leave).
    pub fn reset(&mut self) {
        self.teardown();
        self.room = None;
        self.participants.clear();
        self.chat.clear();
        self.whiteboard.clear();
    }

    fn set_flag(&mut self, connection_id: &str, speaking: bool) {
        if let Some(p) = self
            .participants
            .iter_mut()
            .find(|p| p.connection_id == connection_id)
        {
            p.is_speaking = speaking;
        }
    }
}
