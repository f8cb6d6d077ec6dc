//! # Per-Peer Decode/Playback
//!
//! Every remote participant that has sent at least one voice frame gets its own
//! [`PeerPipeline`]: a playback context opened on the audio backend plus a gain stage.
//! Pipelines live in one arena, [`PlaybackPipelines`], keyed by connection id.
//!
//! ## Lifecycle rules:
//! - **Lazy**: a pipeline is opened on the first *decodable* frame from a sender
//! - **Immediate**: each frame is decoded and handed to the context as it arrives. There is
//!   no jitter buffer, so reordered or bursty delivery is audible
//! - **Torn down on leave**: [`PlaybackPipelines::remove_peer`] drops the pipeline, and
//!   dropping a pipeline always closes its context
//! - **Isolated**: a bad frame or failing context affects only that sender
//!
//! The backend and contexts are single-threaded; they are only ever touched by the
//! client's event loop.

use crate::audio::codec::VoiceCodec;
use crate::error::{ClientError, ClientResult};
use crate::protocol::ConnectionId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

pub const MIN_GAIN: f32 = 0.0;
pub const MAX_GAIN: f32 = 4.0;

/// One open audio output for one remote peer.
pub trait PlaybackContext {
    /// Schedule samples for immediate playback.
    fn play(&mut self, samples: &[f32]) -> ClientResult<()>;

    /// Release the output. Called exactly once, when the owning pipeline drops.
    fn close(&mut self);
}

/// Audio output device able to open one context per peer.
pub trait PlaybackBackend {
    fn open(&mut self, peer: &str, sample_rate: u32) -> ClientResult<Box<dyn PlaybackContext>>;
}

/// Linear gain, clamped to [`MIN_GAIN`, `MAX_GAIN`]. Unity by default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainControl {
    gain: f32,
}

impl Default for GainControl {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

impl GainControl {
    pub fn new(gain: f32) -> Self {
        let mut control = Self::default();
        control.set(gain);
        control
    }

    pub fn get(&self) -> f32 {
        self.gain
    }

    /// Set the gain, returning the value actually applied. NaN is ignored.
    pub fn set(&mut self, gain: f32) -> f32 {
        if !gain.is_nan() {
            self.gain = gain.clamp(MIN_GAIN, MAX_GAIN);
        }
        self.gain
    }

    /// Scale samples in place, keeping them within [-1.0, 1.0].
    pub fn apply(&self, samples: &mut [f32]) {
        if self.gain == 1.0 {
            return;
        }
        for sample in samples.iter_mut() {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
    }
}

/// Playback context and gain for one remote peer.
pub struct PeerPipeline {
    peer: ConnectionId,
    context: Box<dyn PlaybackContext>,
    gain: GainControl,
    frames_played: u64,
}

impl PeerPipeline {
    fn play(&mut self, mut samples: Vec<f32>) -> ClientResult<()> {
        self.gain.apply(&mut samples);
        self.context.play(&samples)?;
        self.frames_played += 1;
        Ok(())
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played
    }
}

impl Drop for PeerPipeline {
    fn drop(&mut self) {
        self.context.close();
        debug!(peer = %self.peer, frames = self.frames_played, "Playback pipeline closed");
    }
}

/// Arena of per-peer pipelines.
pub struct PlaybackPipelines {
    backend: Box<dyn PlaybackBackend>,
    codec: VoiceCodec,
    pipelines: HashMap<ConnectionId, PeerPipeline>,
    /// Gains chosen for peers that have not sent audio yet
    pending_gains: HashMap<ConnectionId, f32>,
}

impl PlaybackPipelines {
    pub fn new(backend: Box<dyn PlaybackBackend>, codec: VoiceCodec) -> Self {
        Self {
            backend,
            codec,
            pipelines: HashMap::new(),
            pending_gains: HashMap::new(),
        }
    }

    /// Decode one voice frame from `sender` and play it through that sender's pipeline.
    ///
    /// Undecodable payloads are a [`ClientError::Protocol`] and never allocate a pipeline.
    /// A backend that cannot open or play is a [`ClientError::Device`].
    pub fn handle_frame(&mut self, sender: &str, payload: &str) -> ClientResult<()> {
        let samples = self.codec.decode(payload)?;

        if !self.pipelines.contains_key(sender) {
            let context = self.backend.open(sender, self.codec.sample_rate())?;
            let gain = self
                .pending_gains
                .remove(sender)
                .map(GainControl::new)
                .unwrap_or_default();
            info!(peer = %sender, gain = gain.get(), "Playback pipeline opened");
            self.pipelines.insert(
                sender.to_string(),
                PeerPipeline {
                    peer: sender.to_string(),
                    context,
                    gain,
                    frames_played: 0,
                },
            );
        }

        match self.pipelines.get_mut(sender) {
            Some(pipeline) => pipeline.play(samples),
            None => Ok(()),
        }
    }

    /// Tear down everything held for `peer`. Returns whether a pipeline existed.
    pub fn remove_peer(&mut self, peer: &str) -> bool {
        self.pending_gains.remove(peer);
        self.pipelines.remove(peer).is_some()
    }

    /// Set the playback gain for `peer`, returning the clamped value.
    pub fn set_gain(&mut self, peer: &str, gain: f32) -> f32 {
        match self.pipelines.get_mut(peer) {
            Some(pipeline) => pipeline.gain.set(gain),
            None => {
                let applied = GainControl::new(gain).get();
                self.pending_gains.insert(peer.to_string(), applied);
                applied
            }
        }
    }

    pub fn gain_of(&self, peer: &str) -> f32 {
        self.pipelines
            .get(peer)
            .map(PeerPipeline::gain)
            .or_else(|| self.pending_gains.get(peer).copied())
            .unwrap_or(1.0)
    }

    /// Close every pipeline (leave, reconnect).
    pub fn clear(&mut self) {
        if !self.pipelines.is_empty() {
            info!(count = self.pipelines.len(), "Closing all playback pipelines");
        }
        self.pipelines.clear();
        self.pending_gains.clear();
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.pipelines.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }
}

/// Backend that discards audio. Used by the terminal client.
#[derive(Debug, Default)]
pub struct NullBackend;

struct NullContext;

impl PlaybackContext for NullContext {
    fn play(&mut self, _samples: &[f32]) -> ClientResult<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

impl PlaybackBackend for NullBackend {
    fn open(&mut self, _peer: &str, _sample_rate: u32) -> ClientResult<Box<dyn PlaybackContext>> {
        Ok(Box::new(NullContext))
    }
}

/// What a [`RecordingBackend`] saw.
#[derive(Debug, Default)]
pub struct PlaybackLog {
    pub opened: Vec<ConnectionId>,
    pub closed: Vec<ConnectionId>,
    /// Samples played per peer, after gain
    pub played: HashMap<ConnectionId, Vec<f32>>,
}

impl PlaybackLog {
    /// Peers with an open context right now.
    pub fn open_contexts(&self) -> Vec<ConnectionId> {
        let mut open = self.opened.clone();
        for closed in &self.closed {
            if let Some(pos) = open.iter().position(|p| p == closed) {
                open.remove(pos);
            }
        }
        open
    }
}

/// Backend that records every call into a shared [`PlaybackLog`].
///
/// Lets tests observe pipeline lifecycle from outside the client that owns the backend.
#[derive(Debug, Default, Clone)]
pub struct RecordingBackend {
    log: Rc<RefCell<PlaybackLog>>,
    fail_open: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` fails, like an output device that disappeared.
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> Rc<RefCell<PlaybackLog>> {
        Rc::clone(&self.log)
    }
}

struct RecordingContext {
    peer: ConnectionId,
    log: Rc<RefCell<PlaybackLog>>,
}

impl PlaybackContext for RecordingContext {
    fn play(&mut self, samples: &[f32]) -> ClientResult<()> {
        self.log
            .borrow_mut()
            .played
            .entry(self.peer.clone())
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }

    fn close(&mut self) {
        self.log.borrow_mut().closed.push(self.peer.clone());
    }
}

impl PlaybackBackend for RecordingBackend {
    fn open(&mut self, peer: &str, _sample_rate: u32) -> ClientResult<Box<dyn PlaybackContext>> {
        if self.fail_open {
            warn!(peer = %peer, "Playback device unavailable");
            return Err(ClientError::Device("Playback device unavailable".to_string()));
        }
        self.log.borrow_mut().opened.push(peer.to_string());
        Ok(Box::new(RecordingContext {
            peer: peer.to_string(),
            log: Rc::clone(&self.log),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PlaybackPipelines, Rc<RefCell<PlaybackLog>>, VoiceCodec) {
        let backend = RecordingBackend::new();
        let log = backend.log();
        let codec = VoiceCodec::new(44_100);
        (PlaybackPipelines::new(Box::new(backend), codec), log, codec)
    }

    #[test]
    fn test_gain_clamps() {
        let mut gain = GainControl::default();
        assert_eq!(gain.get(), 1.0);
        assert_eq!(gain.set(9.0), MAX_GAIN);
        assert_eq!(gain.set(-1.0), MIN_GAIN);
        assert_eq!(gain.set(f32::NAN), MIN_GAIN);

        let mut samples = vec![0.5, -0.5];
        GainControl::new(4.0).apply(&mut samples);
        assert_eq!(samples, vec![1.0, -1.0]);
    }

    #[test]
    fn test_pipeline_opens_lazily_per_peer() {
        let (mut pipelines, log, codec) = setup();
        assert!(pipelines.is_empty());

        let payload = codec.encode(&[0.25; 8]);
        pipelines.handle_frame("bob", &payload).unwrap();
        pipelines.handle_frame("bob", &payload).unwrap();
        pipelines.handle_frame("carol", &payload).unwrap();

        assert_eq!(pipelines.len(), 2);
        assert_eq!(log.borrow().opened, vec!["bob", "carol"]);
        assert_eq!(log.borrow().played["bob"].len(), 16);
    }

    #[test]
    fn test_leave_tears_down_pipeline() {
        let (mut pipelines, log, codec) = setup();
        let payload = codec.encode(&[0.1; 4]);
        pipelines.handle_frame("bob", &payload).unwrap();
        pipelines.handle_frame("carol", &payload).unwrap();

        assert!(pipelines.remove_peer("bob"));
        assert!(!pipelines.contains("bob"));
        assert!(!pipelines.remove_peer("bob"));
        assert_eq!(log.borrow().closed, vec!["bob"]);
        assert_eq!(log.borrow().open_contexts(), vec!["carol"]);

        pipelines.clear();
        assert!(log.borrow().open_contexts().is_empty());
    }

    #[test]
    fn test_churn_leaves_no_contexts_behind() {
        let (mut pipelines, log, codec) = setup();
        let payload = codec.encode(&[0.1; 4]);
        for round in 0..50 {
            let peer = format!("peer-{}", round);
            pipelines.handle_frame(&peer, &payload).unwrap();
            pipelines.remove_peer(&peer);
        }
        assert!(pipelines.is_empty());
        assert_eq!(log.borrow().opened.len(), 50);
        assert!(log.borrow().open_contexts().is_empty());
    }

    #[test]
    fn test_bad_frame_is_isolated() {
        let (mut pipelines, log, codec) = setup();
        pipelines
            .handle_frame("bob", &codec.encode(&[0.1; 4]))
            .unwrap();

        let err = pipelines.handle_frame("mallory", "%%%").unwrap_err();
        assert_eq!(err.category(), "protocol");
        assert!(!pipelines.contains("mallory"));

        pipelines
            .handle_frame("bob", &codec.encode(&[0.1; 4]))
            .unwrap();
        assert_eq!(log.borrow().played["bob"].len(), 8);
    }

    #[test]
    fn test_gain_applies_before_and_after_first_frame() {
        let (mut pipelines, log, codec) = setup();
        assert_eq!(pipelines.set_gain("bob", 0.5), 0.5);
        pipelines
            .handle_frame("bob", &codec.encode(&[0.5; 2]))
            .unwrap();
        assert_eq!(pipelines.gain_of("bob"), 0.5);

        pipelines.set_gain("bob", 2.0);
        pipelines
            .handle_frame("bob", &codec.encode(&[0.25; 2]))
            .unwrap();

        let played = log.borrow().played["bob"].clone();
        assert!((played[0] - 0.25).abs() < 1e-3);
        assert!((played[2] - 0.5).abs() < 1e-3);
        assert_eq!(pipelines.gain_of("nobody"), 1.0);
    }

    #[test]
    fn test_failing_backend_is_device_error() {
        let codec = VoiceCodec::new(44_100);
        let mut pipelines = PlaybackPipelines::new(Box::new(RecordingBackend::failing()), codec);
        let err = pipelines
            .handle_frame("bob", &codec.encode(&[0.1]))
            .unwrap_err();
        assert_eq!(err.category(), "device");
        assert!(pipelines.is_empty());
    }
}
