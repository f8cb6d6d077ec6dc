//! # Audio Capture
//!
//! The microphone is an opaque source of float sample buffers. [`AudioSource`] is the seam
//! a real device driver plugs into; the session client only ever sees a [`CaptureAdapter`],
//! which turns start/stop into a channel of fixed-size buffers it can `select!` on.
//!
//! Buffers flow through a tokio channel instead of a callback so capture never calls into
//! client state: the client's single event loop pulls them when it is ready.

use crate::error::{ClientError, ClientResult};
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A local audio device yielding mono float samples in [-1.0, 1.0].
pub trait AudioSource {
    /// Start pushing buffers into `sink`. Fails with [`ClientError::Device`] when the device
    /// is unavailable or access is denied.
    fn start(&mut self, sink: UnboundedSender<Vec<f32>>) -> ClientResult<()>;

    /// Stop producing buffers. Must be idempotent.
    fn stop(&mut self) -> ClientResult<()>;

    fn sample_rate(&self) -> u32;
}

/// Start/stop wrapper around an [`AudioSource`].
pub struct CaptureAdapter {
    source: Box<dyn AudioSource>,
    frames: Option<UnboundedReceiver<Vec<f32>>>,
}

impl CaptureAdapter {
    pub fn new(source: Box<dyn AudioSource>) -> Self {
        Self {
            source,
            frames: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    pub fn is_capturing(&self) -> bool {
        self.frames.is_some()
    }

    /// Start capture. Starting twice is a no-op.
    pub fn start(&mut self) -> ClientResult<()> {
        if self.frames.is_some() {
            return Ok(());
        }
        let (sink, frames) = unbounded_channel();
        self.source.start(sink)?;
        self.frames = Some(frames);
        info!(sample_rate = self.source.sample_rate(), "Audio capture started");
        Ok(())
    }

    /// Stop capture and discard any buffers not yet consumed.
    pub fn stop(&mut self) -> ClientResult<()> {
        if self.frames.take().is_some() {
            info!("Audio capture stopped");
        }
        self.source.stop()
    }

    /// Next captured buffer.
    ///
    /// Pends forever while not capturing, so it can sit in a `select!` unconditionally.
    /// Returns `None` once if the source ended on its own; capture is then stopped.
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        let Some(frames) = self.frames.as_mut() else {
            return std::future::pending().await;
        };
        let frame = frames.recv().await;
        if frame.is_none() {
            debug!("Audio source closed its stream");
            self.frames = None;
        }
        frame
    }
}

/// Synthetic sine-wave microphone, used by the terminal client which has no device access.
pub struct ToneSource {
    sample_rate: u32,
    frame_size: usize,
    frequency: f32,
    amplitude: f32,
    task: Option<JoinHandle<()>>,
}

impl ToneSource {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            sample_rate,
            frame_size,
            frequency: 440.0,
            amplitude: 0.3,
            task: None,
        }
    }

    pub fn with_frequency(mut self, frequency: f32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

impl AudioSource for ToneSource {
    fn start(&mut self, sink: UnboundedSender<Vec<f32>>) -> ClientResult<()> {
        if self.sample_rate == 0 || self.frame_size == 0 {
            return Err(ClientError::Device(
                "Tone source needs a positive sample rate and frame size".to_string(),
            ));
        }
        self.stop()?;

        let (rate, size) = (self.sample_rate as f32, self.frame_size);
        let (frequency, amplitude) = (self.frequency, self.amplitude);
        let mut interval = tokio::time::interval(self.frame_period());

        self.task = Some(tokio::spawn(async move {
            let mut phase = 0.0f32;
            let step = TAU * frequency / rate;
            loop {
                interval.tick().await;
                let frame: Vec<f32> = (0..size)
                    .map(|_| {
                        let sample = phase.sin() * amplitude;
                        phase = (phase + step) % TAU;
                        sample
                    })
                    .collect();
                if sink.send(frame).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> ClientResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for ToneSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Mock audio source for testing.
///
/// Delivers a fixed list of buffers as soon as it is started.
#[derive(Default)]
pub struct MockAudioSource {
    frames: Vec<Vec<f32>>,
    sample_rate: u32,
    fail_start: Option<String>,
    started: bool,
    /// Kept so the stream stays open until `stop`
    sink: Option<UnboundedSender<Vec<f32>>>,
}

impl MockAudioSource {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    /// Configure the mock to deliver specific buffers
    pub fn with_frames(mut self, frames: Vec<Vec<f32>>) -> Self {
        self.frames = frames;
        self
    }

    /// Configure the mock to fail on start, like a denied microphone
    pub fn with_start_failure(mut self, message: &str) -> Self {
        self.fail_start = Some(message.to_string());
        self
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self, sink: UnboundedSender<Vec<f32>>) -> ClientResult<()> {
        if let Some(message) = &self.fail_start {
            return Err(ClientError::Device(message.clone()));
        }
        for frame in &self.frames {
            let _ = sink.send(frame.clone());
        }
        self.sink = Some(sink);
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> ClientResult<()> {
        self.sink = None;
        self.started = false;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_adapter_delivers_frames_in_order() {
        let source = MockAudioSource::new(44_100).with_frames(vec![vec![0.1; 4], vec![0.2; 4]]);
        let mut capture = CaptureAdapter::new(Box::new(source));
        assert!(!capture.is_capturing());

        capture.start().unwrap();
        assert!(capture.is_capturing());
        assert_eq!(capture.next_frame().await, Some(vec![0.1; 4]));
        assert_eq!(capture.next_frame().await, Some(vec![0.2; 4]));

        capture.stop().unwrap();
        assert!(!capture.is_capturing());
        // Idempotent
        capture.stop().unwrap();
    }

    #[tokio::test]
    async fn test_denied_device_is_a_device_error() {
        let source = MockAudioSource::new(44_100).with_start_failure("permission denied");
        let mut capture = CaptureAdapter::new(Box::new(source));

        let err = capture.start().unwrap_err();
        assert_eq!(err, ClientError::Device("permission denied".to_string()));
        assert!(!capture.is_capturing());
    }

    #[tokio::test]
    async fn test_next_frame_pends_while_stopped() {
        let mut capture = CaptureAdapter::new(Box::new(MockAudioSource::new(44_100)));
        let result =
            tokio::time::timeout(Duration::from_millis(20), capture.next_frame()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tone_source_produces_fixed_size_frames() {
        let source = ToneSource::new(8_000, 80).with_amplitude(0.5);
        let mut capture = CaptureAdapter::new(Box::new(source));
        capture.start().unwrap();

        let frame = capture.next_frame().await.unwrap();
        assert_eq!(frame.len(), 80);
        assert!(frame.iter().all(|s| s.abs() <= 0.5));
        assert!(frame.iter().any(|s| s.abs() > 0.1));
        capture.stop().unwrap();
    }

    #[test]
    fn test_tone_source_rejects_zero_rate() {
        let (tx, _rx) = unbounded_channel();
        let mut source = ToneSource::new(0, 80);
        assert!(matches!(source.start(tx), Err(ClientError::Device(_))));
    }
}
