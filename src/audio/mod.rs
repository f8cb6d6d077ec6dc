//! # Audio Module
//!
//! Client-side voice path. The server never touches audio beyond relaying payloads.
//!
//! ## Key Components:
//! - **capture**: microphone seam and the start/stop adapter the client drives
//! - **activity**: sender-side voice activity detection (voiceStart / voiceEnd)
//! - **codec**: f32 ⇄ little-endian PCM16 ⇄ base64 payload
//! - **playback**: per-peer decode/playback pipelines and gain
//!
//! ## Audio Format:
//! - **Sample Rate**: 44.1 kHz by default, fixed for the whole room
//! - **Bit Depth**: 16-bit PCM on the wire
//! - **Channels**: Mono

pub mod activity;
pub mod capture;
pub mod codec;
pub mod playback;

pub use activity::{VadConfig, VoiceActivity, VoiceActivityDetector};
pub use capture::{AudioSource, CaptureAdapter, MockAudioSource, ToneSource};
pub use codec::{CodecError, VoiceCodec};
pub use playback::{
    GainControl, NullBackend, PlaybackBackend, PlaybackContext, PlaybackPipelines,
    RecordingBackend,
};
