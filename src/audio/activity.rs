//! Sender-side voice activity detection.
//!
//! Decides when the local participant starts and stops talking so the client can announce
//! `voiceStart` / `voiceEnd`. Detection is plain RMS against a threshold with a hold time,
//! so pauses between words do not end a talk spurt.
//!
//! Time is the sum of processed buffer durations, not the wall clock, which keeps the
//! detector deterministic under test and immune to scheduling jitter.

use std::time::Duration;

/// What the caller should announce after a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    /// Crossed into speech: send `voiceStart`
    Started,
    /// Still speaking for another refresh period: send `voiceStart` again so remote
    /// debounce windows do not lapse mid-sentence
    Refresh,
    /// Hold time of silence elapsed: send `voiceEnd`
    Ended,
}

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS level (0.0 to 1.0) above which a buffer counts as voiced
    pub threshold: f32,
    /// Silence needed before speech is considered ended
    pub hold: Duration,
    /// Interval between repeated `voiceStart` while speaking
    pub refresh: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            hold: Duration::from_millis(400),
            refresh: Duration::from_millis(1000),
        }
    }
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    clock: Duration,
    speaking: bool,
    last_voiced: Duration,
    last_announced: Duration,
    level: f32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            clock: Duration::ZERO,
            speaking: false,
            last_voiced: Duration::ZERO,
            last_announced: Duration::ZERO,
            level: 0.0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// RMS of the last processed buffer.
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Feed one captured buffer lasting `duration`.
    pub fn process(&mut self, samples: &[f32], duration: Duration) -> Option<VoiceActivity> {
        if samples.is_empty() {
            return None;
        }
        self.clock += duration;
        self.level = rms(samples);

        if self.level > self.config.threshold {
            self.last_voiced = self.clock;
            if !self.speaking {
                self.speaking = true;
                self.last_announced = self.clock;
                return Some(VoiceActivity::Started);
            }
            if self.clock - self.last_announced >= self.config.refresh {
                self.last_announced = self.clock;
                return Some(VoiceActivity::Refresh);
            }
            return None;
        }

        if self.speaking && self.clock - self.last_voiced >= self.config.hold {
            self.speaking = false;
            return Some(VoiceActivity::Ended);
        }
        None
    }

    /// Drop back to silence, e.g. when capture stops. Returns whether speech was in progress,
    /// in which case the caller still owes a `voiceEnd`.
    pub fn reset(&mut self) -> bool {
        let was_speaking = self.speaking;
        self.speaking = false;
        self.clock = Duration::ZERO;
        self.last_voiced = Duration::ZERO;
        self.last_announced = Duration::ZERO;
        self.level = 0.0;
        was_speaking
    }
}

/// Root mean square of a buffer.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(100);

    fn loud() -> Vec<f32> {
        vec![0.5; 64]
    }

    fn quiet() -> Vec<f32> {
        vec![0.001; 64]
    }

    fn detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(VadConfig {
            threshold: 0.02,
            hold: Duration::from_millis(300),
            refresh: Duration::from_millis(500),
        })
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_start_then_end_after_hold() {
        let mut vad = detector();
        assert_eq!(vad.process(&quiet(), FRAME), None);
        assert_eq!(vad.process(&loud(), FRAME), Some(VoiceActivity::Started));
        assert!(vad.is_speaking());

        // Two quiet frames are a pause between words
        assert_eq!(vad.process(&quiet(), FRAME), None);
        assert_eq!(vad.process(&quiet(), FRAME), None);
        assert_eq!(vad.process(&quiet(), FRAME), Some(VoiceActivity::Ended));
        assert!(!vad.is_speaking());
        assert_eq!(vad.process(&quiet(), FRAME), None);
    }

    #[test]
    fn test_short_pause_does_not_end_speech() {
        let mut vad = detector();
        vad.process(&loud(), FRAME);
        vad.process(&quiet(), FRAME);
        vad.process(&quiet(), FRAME);
        assert_eq!(vad.process(&loud(), FRAME), None);
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_refresh_while_speaking() {
        let mut vad = detector();
        let events: Vec<_> = (0..11).map(|_| vad.process(&loud(), FRAME)).collect();
        assert_eq!(events[0], Some(VoiceActivity::Started));
        assert_eq!(events[5], Some(VoiceActivity::Refresh));
        assert_eq!(events[10], Some(VoiceActivity::Refresh));
        assert_eq!(events.iter().flatten().count(), 3);
    }

    #[test]
    fn test_empty_buffer_is_ignored() {
        let mut vad = detector();
        assert_eq!(vad.process(&[], FRAME), None);
        assert_eq!(vad.level(), 0.0);
    }

    #[test]
    fn test_reset_reports_open_speech() {
        let mut vad = detector();
        assert!(!vad.reset());
        vad.process(&loud(), FRAME);
        assert!(vad.reset());
        assert!(!vad.is_speaking());
        assert_eq!(vad.process(&loud(), FRAME), Some(VoiceActivity::Started));
    }
}
