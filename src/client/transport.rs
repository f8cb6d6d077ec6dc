//! # Session Transport Client
//!
//! Owns the single WebSocket connection to the room server and everything that depends on
//! it. [`SessionClient::run`] is one consumer loop that `select!`s over:
//!
//! - commands from any number of [`SessionHandle`] clones
//! - inbound frames from the server
//! - captured microphone buffers
//! - a periodic tick that expires speaking indicators
//!
//! Nothing else touches client state, so there are no locks and nothing needs `Send`; the
//! loop runs on a current-thread runtime or inside a `LocalSet`.
//!
//! ## Connection lifecycle:
//! 1. **Connect + join**: open the socket, send `join`, wait for `joined`, all within
//!    `join_timeout_ms`. A server `error` reply is final; anything else is retried
//! 2. **Session**: server events go through the [`SessionMirror`]; captured audio goes
//!    through voice activity detection and the codec to the socket
//! 3. **Drop**: playback pipelines and speaking state are torn down, nothing is buffered,
//!    and the client reconnects with exponential backoff and the same display name
//! 4. **Leave**: capture stops and pipelines close before `leave()` returns; no reconnect
//!
//! Chat and whiteboard commands are written to the socket once and never retried, so they
//! are delivered at most once.

use crate::audio::{
    AudioSource, CaptureAdapter, PlaybackBackend, PlaybackPipelines, VoiceActivity,
    VoiceActivityDetector, VoiceCodec,
};
use crate::client::config::ClientConfig;
use crate::client::mirror::{ClientEvent, PresentationState, SessionMirror};
use crate::client::speaking::SpeakingTracker;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{ClientMessage, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Requests from a [`SessionHandle`] to the client loop.
enum Command {
    SendChat {
        text: String,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    UpdateWhiteboard {
        image_reference: String,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    StartVoice {
        reply: oneshot::Sender<ClientResult<()>>,
    },
    StopVoice {
        reply: oneshot::Sender<ClientResult<()>>,
    },
    SetPeerGain {
        peer: String,
        gain: f32,
        reply: oneshot::Sender<f32>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable remote control for a running [`SessionClient`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> ClientResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| not_running())?;
        response.await.map_err(|_| not_running())
    }

    /// Post a chat message to the room. Blank text is ignored.
    pub async fn send_chat(&self, text: impl Into<String>) -> ClientResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendChat { text, reply })
            .await?
    }

    /// Overwrite the room whiteboard. A blank reference is ignored.
    pub async fn update_whiteboard(&self, image_reference: impl Into<String>) -> ClientResult<()> {
        let image_reference = image_reference.into();
        self.request(|reply| Command::UpdateWhiteboard {
            image_reference,
            reply,
        })
        .await?
    }

    /// Start microphone capture. Fails with [`ClientError::Device`] if the device refuses.
    pub async fn start_voice(&self) -> ClientResult<()> {
        self.request(|reply| Command::StartVoice { reply }).await?
    }

    pub async fn stop_voice(&self) -> ClientResult<()> {
        self.request(|reply| Command::StopVoice { reply }).await?
    }

    /// Set the playback gain for one peer, returning the clamped value applied.
    pub async fn set_peer_gain(&self, peer: impl Into<String>, gain: f32) -> ClientResult<f32> {
        let peer = peer.into();
        self.request(|reply| Command::SetPeerGain { peer, gain, reply })
            .await
    }

    /// Leave the room. When this returns, capture is stopped and no playback pipeline is open.
    pub async fn leave(&self) -> ClientResult<()> {
        self.request(|reply| Command::Leave { reply }).await
    }
}

fn not_running() -> ClientError {
    ClientError::State("Session client is not running".to_string())
}

fn not_joined() -> ClientError {
    ClientError::State("Not joined to a room".to_string())
}

/// Why the loop is stopping for good.
#[derive(Debug)]
enum Stop {
    Left,
    /// Every handle was dropped
    Abandoned,
}

enum SessionEnd {
    Stopped(Stop),
    Dropped(String),
}

enum ConnectFailure {
    /// Server answered `join` with an error; retrying would get the same answer
    Refused(ClientError),
    Transient(ClientError),
    Stopped(Stop),
}

/// Receiving ends handed out by [`SessionClient::new`].
pub struct SessionChannels {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub presentation: watch::Receiver<PresentationState>,
}

pub struct SessionClient {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    presentation: watch::Sender<PresentationState>,
    mirror: SessionMirror,
    capture: CaptureAdapter,
    vad: VoiceActivityDetector,
    codec: VoiceCodec,
    /// Capture requested by the user; survives reconnects
    voice_wanted: bool,
}

impl SessionClient {
    pub fn new(
        config: ClientConfig,
        source: Box<dyn AudioSource>,
        backend: Box<dyn PlaybackBackend>,
    ) -> (Self, SessionChannels) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (presentation, presentation_rx) = watch::channel(PresentationState::default());

        let codec = VoiceCodec::new(config.sample_rate);
        let mirror = SessionMirror::new(
            SpeakingTracker::new(config.speaking()),
            PlaybackPipelines::new(backend, codec),
        );
        let vad = VoiceActivityDetector::new(config.vad());

        let client = Self {
            config,
            commands,
            events,
            presentation,
            mirror,
            capture: CaptureAdapter::new(source),
            vad,
            codec,
            voice_wanted: false,
        };
        let channels = SessionChannels {
            handle: SessionHandle {
                commands: command_tx,
            },
            events: event_rx,
            presentation: presentation_rx,
        };
        (client, channels)
    }

    /// Drive the session until the user leaves, every handle is dropped, the join is
    /// refused, or reconnection gives up.
    pub async fn run(mut self) -> ClientResult<()> {
        let mut failures: u32 = 0;

        loop {
            match self.connect().await {
                Ok((ws, joined)) => {
                    failures = 0;
                    match self.session(ws, joined).await {
                        SessionEnd::Stopped(stop) => {
                            debug!(?stop, "Session client stopping");
                            return Ok(());
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!(reason = %reason, "Connection to room lost");
                            self.drop_connection();
                        }
                    }
                }
                Err(ConnectFailure::Stopped(stop)) => {
                    debug!(?stop, "Session client stopping before join");
                    return Ok(());
                }
                Err(ConnectFailure::Refused(err)) => {
                    error!("Join refused: {}", err);
                    self.emit(ClientEvent::Error(err.clone()));
                    self.emit(ClientEvent::Disconnected {
                        reason: err.to_string(),
                    });
                    return Err(err);
                }
                Err(ConnectFailure::Transient(err)) => {
                    failures += 1;
                    warn!(attempt = failures, "Connection attempt failed: {}", err);
                    if failures >= self.config.max_reconnect_attempts {
                        let err = ClientError::Connection(format!(
                            "Giving up after {} attempts: {}",
                            failures, err
                        ));
                        error!("{}", err);
                        self.emit(ClientEvent::Error(err.clone()));
                        self.emit(ClientEvent::Disconnected {
                            reason: err.to_string(),
                        });
                        return Err(err);
                    }
                }
            }

            let attempt = failures + 1;
            let delay = self.config.reconnect_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.emit(ClientEvent::Reconnecting { attempt, delay });
            if let Some(stop) = self.wait_offline(delay).await {
                debug!(?stop, "Session client stopping while offline");
                return Ok(());
            }
        }
    }

    async fn connect(&mut self) -> Result<(WsStream, ServerEvent), ConnectFailure> {
        let join = ClientMessage::Join {
            display_name: self.config.display_name.clone(),
            room: self.config.room_id(),
        };
        let timeout = self.config.join_timeout();
        let handshake =
            tokio::time::timeout(timeout, handshake(self.config.server_url.clone(), join));
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                result = &mut handshake => {
                    return match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ConnectFailure::Transient(ClientError::Connection(format!(
                            "No join acknowledgement within {}ms",
                            timeout.as_millis()
                        )))),
                    };
                }
                command = self.commands.recv() => {
                    if let Some(stop) = self.handle_offline(command) {
                        return Err(ConnectFailure::Stopped(stop));
                    }
                }
            }
        }
    }

    async fn wait_offline(&mut self, delay: std::time::Duration) -> Option<Stop> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.recv() => {
                    if let Some(stop) = self.handle_offline(command) {
                        return Some(stop);
                    }
                }
            }
        }
    }

    /// Serve a command while there is no joined connection.
    fn handle_offline(&mut self, command: Option<Command>) -> Option<Stop> {
        let Some(command) = command else {
            return Some(Stop::Abandoned);
        };

        match command {
            Command::SendChat { reply, .. }
            | Command::UpdateWhiteboard { reply, .. }
            | Command::StartVoice { reply } => {
                let _ = reply.send(Err(not_joined()));
            }
            Command::StopVoice { reply } => {
                self.voice_wanted = false;
                let _ = reply.send(Ok(()));
            }
            Command::SetPeerGain { peer, gain, reply } => {
                let _ = reply.send(self.mirror.set_peer_gain(&peer, gain));
            }
            Command::Leave { reply } => {
                self.leave_locally();
                let _ = reply.send(());
                return Some(Stop::Left);
            }
        }
        None
    }

    async fn session(&mut self, mut ws: WsStream, joined: ServerEvent) -> SessionEnd {
        info!(server = %self.config.server_url, "Joined room");
        self.apply_server_event(joined);

        if self.voice_wanted {
            if let Err(err) = self.capture.start() {
                self.voice_wanted = false;
                self.emit(ClientEvent::Error(err));
            }
        }

        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = ws.close(None).await;
                        self.leave_locally();
                        return SessionEnd::Stopped(Stop::Abandoned);
                    };
                    if let Some(end) = self.handle_command(command, &mut ws).await {
                        return end;
                    }
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Ignoring binary frame from server");
                        self.emit(ClientEvent::Error(ClientError::Protocol(
                            "Unexpected binary frame".to_string(),
                        )));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Dropped(format!("Server closed the connection: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                    None => return SessionEnd::Dropped("Connection stream ended".to_string()),
                },
                frame = self.capture.next_frame() => match frame {
                    Some(samples) => {
                        if let Err(err) = self.handle_capture(samples, &mut ws).await {
                            return SessionEnd::Dropped(err.to_string());
                        }
                    }
                    None => {
                        self.voice_wanted = false;
                        self.emit(ClientEvent::Error(ClientError::Device(
                            "Audio source stopped unexpectedly".to_string(),
                        )));
                    }
                },
                _ = tick.tick() => {
                    let events = self.mirror.tick(Instant::now());
                    if !events.is_empty() {
                        self.emit_all(events);
                        self.publish();
                    }
                }
            }
        }
    }

    /// Serve a command on a joined connection. `Some` ends the session.
    async fn handle_command(&mut self, command: Command, ws: &mut WsStream) -> Option<SessionEnd> {
        match command {
            Command::SendChat { text, reply } => {
                if text.trim().is_empty() {
                    let _ = reply.send(Ok(()));
                    return None;
                }
                let result = send(ws, &ClientMessage::ChatMessage { text }).await;
                return self.reply_sent(result, reply);
            }
            Command::UpdateWhiteboard {
                image_reference,
                reply,
            } => {
                if image_reference.trim().is_empty() {
                    let _ = reply.send(Ok(()));
                    return None;
                }
                let result = send(ws, &ClientMessage::WhiteboardImage { image_reference }).await;
                return self.reply_sent(result, reply);
            }
            Command::StartVoice { reply } => {
                let result = self.capture.start();
                match &result {
                    Ok(()) => self.voice_wanted = true,
                    Err(err) => {
                        warn!("Cannot start voice: {}", err);
                        self.emit(ClientEvent::Error(err.clone()));
                    }
                }
                let _ = reply.send(result);
            }
            Command::StopVoice { reply } => {
                self.voice_wanted = false;
                let stopped = self.capture.stop();
                let sent = self.end_local_speech(ws).await;
                let _ = reply.send(stopped.and(sent.clone()));
                if let Err(err) = sent {
                    return Some(SessionEnd::Dropped(err.to_string()));
                }
            }
            Command::SetPeerGain { peer, gain, reply } => {
                let _ = reply.send(self.mirror.set_peer_gain(&peer, gain));
            }
            Command::Leave { reply } => {
                self.leave_locally();
                // Best effort: the server treats a closed socket as a leave too
                let _ = send(ws, &ClientMessage::Leave).await;
                let _ = ws.close(None).await;
                let _ = reply.send(());
                return Some(SessionEnd::Stopped(Stop::Left));
            }
        }
        None
    }

    /// Answer a chat/whiteboard command after a write. A failed write ends the session.
    fn reply_sent(
        &mut self,
        result: ClientResult<()>,
        reply: oneshot::Sender<ClientResult<()>>,
    ) -> Option<SessionEnd> {
        let end = result
            .as_ref()
            .err()
            .map(|err| SessionEnd::Dropped(err.to_string()));
        let _ = reply.send(result);
        end
    }

    async fn handle_capture(&mut self, samples: Vec<f32>, ws: &mut WsStream) -> ClientResult<()> {
        let duration = self.codec.duration_of(samples.len());
        let now = Instant::now();

        match self.vad.process(&samples, duration) {
            Some(VoiceActivity::Started) | Some(VoiceActivity::Refresh) => {
                send(ws, &ClientMessage::VoiceStart).await?;
                if let Some(event) = self.mirror.local_voice_start(now) {
                    self.emit(event);
                    self.publish();
                }
            }
            Some(VoiceActivity::Ended) => {
                send(ws, &ClientMessage::VoiceEnd).await?;
                self.mirror.local_voice_end(now);
            }
            None => {}
        }

        // Frames are sent while speech is detected, including the hold time
        if self.vad.is_speaking() {
            let payload = self.codec.encode(&samples);
            send(ws, &ClientMessage::Voice { payload }).await?;
        }
        Ok(())
    }

    /// Close an open talk spurt after capture stops.
    async fn end_local_speech(&mut self, ws: &mut WsStream) -> ClientResult<()> {
        if self.vad.reset() {
            self.mirror.local_voice_end(Instant::now());
            send(ws, &ClientMessage::VoiceEnd).await?;
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => self.apply_server_event(event),
            Err(err) => {
                warn!("Dropping undecodable server frame: {}", err);
                self.emit(ClientEvent::Error(err.into()));
            }
        }
    }

    fn apply_server_event(&mut self, event: ServerEvent) {
        debug!(kind = event.kind(), "Server event");
        let events = self.mirror.apply(event, Instant::now());
        self.emit_all(events);
        self.publish();
    }

    /// Connection lost: nothing tied to it survives.
    fn drop_connection(&mut self) {
        let _ = self.capture.stop();
        self.vad.reset();
        self.mirror.teardown();
        self.publish();
    }

    /// Stop capture and close every pipeline. Runs before a leave is acknowledged.
    fn leave_locally(&mut self) {
        self.voice_wanted = false;
        if let Err(err) = self.capture.stop() {
            warn!("Failed to stop capture: {}", err);
        }
        self.vad.reset();
        self.mirror.reset();
        self.publish();
        self.emit(ClientEvent::Left);
        info!("Left room");
    }

    fn publish(&self) {
        let state = self.mirror.presentation();
        self.presentation.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<ClientEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

async fn send(ws: &mut WsStream, message: &ClientMessage) -> ClientResult<()> {
    let json = serde_json::to_string(message)?;
    ws.send(Message::Text(json)).await?;
    Ok(())
}

/// Open the socket and complete the join. Returns the `joined` event.
async fn handshake(
    url: String,
    join: ClientMessage,
) -> Result<(WsStream, ServerEvent), ConnectFailure> {
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| ConnectFailure::Transient(e.into()))?;
    send(&mut ws, &join)
        .await
        .map_err(ConnectFailure::Transient)?;

    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| ConnectFailure::Transient(e.into()))?;
        match frame {
            Message::Text(text) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event @ ServerEvent::Joined { .. }) => return Ok((ws, event)),
                Ok(ServerEvent::Error { code, message }) => {
                    return Err(ConnectFailure::Refused(ClientError::Connection(format!(
                        "{} ({})",
                        message, code
                    ))));
                }
                Ok(other) => debug!(kind = other.kind(), "Ignoring event before join"),
                Err(err) => warn!("Undecodable frame during join: {}", err),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(ConnectFailure::Transient(ClientError::Connection(
        "Connection closed during join".to_string(),
    )))
}
