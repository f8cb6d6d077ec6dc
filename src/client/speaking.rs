//! Debounced "is speaking" state per participant.
//!
//! Each participant is either `Silent` or `Speaking` with a deadline. `voiceStart` enters
//! or extends `Speaking` by the debounce window; `voiceEnd` pulls the deadline in to a short
//! grace period; [`SpeakingTracker::tick`] drops everyone whose deadline has passed.
//!
//! All methods take `now` explicitly. The tracker owns no timers, so its behaviour is a
//! pure function of the event sequence and the instants supplied.

use crate::protocol::ConnectionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakingConfig {
    /// Silence after the last `voiceStart` before the indicator drops
    pub debounce: Duration,
    /// Delay between an explicit `voiceEnd` and the indicator dropping
    pub grace: Duration,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2_000),
            grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct SpeakingTracker {
    config: SpeakingConfig,
    /// Speaking participants and when they fall silent
    deadlines: HashMap<ConnectionId, Instant>,
}

impl SpeakingTracker {
    pub fn new(config: SpeakingConfig) -> Self {
        Self {
            config,
            deadlines: HashMap::new(),
        }
    }

    /// Returns `true` on a `Silent → Speaking` transition, `false` when it only reset the
    /// debounce timer.
    pub fn voice_start(&mut self, connection_id: &str, now: Instant) -> bool {
        let deadline = now + self.config.debounce;
        self.deadlines
            .insert(connection_id.to_string(), deadline)
            .is_none()
    }

    /// Schedule the drop to silence after the grace delay. Returns whether the participant
    /// was speaking.
    pub fn voice_end(&mut self, connection_id: &str, now: Instant) -> bool {
        match self.deadlines.get_mut(connection_id) {
            Some(deadline) => {
                *deadline = (*deadline).min(now + self.config.grace);
                true
            }
            None => false,
        }
    }

    /// Apply expired deadlines. Returns the participants that just went silent, sorted.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionId> {
        let mut silenced: Vec<ConnectionId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &silenced {
            self.deadlines.remove(id);
        }
        silenced.sort();
        silenced
    }

    /// Drop a participant that left. Returns whether it was speaking.
    pub fn forget(&mut self, connection_id: &str) -> bool {
        self.deadlines.remove(connection_id).is_some()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_speaking(&self, connection_id: &str) -> bool {
        self.deadlines.contains_key(connection_id)
    }

    /// Currently speaking participants, sorted.
    pub fn speaking_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.deadlines.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Earliest pending deadline, if anyone is speaking.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_silent_after_debounce_window() {
        let mut tracker = SpeakingTracker::new(SpeakingConfig::default());
        let t0 = Instant::now();

        assert!(tracker.voice_start("alice", t0));
        assert!(tracker.is_speaking("alice"));
        assert!(tracker.tick(t0 + ms(1_999)).is_empty());

        assert_eq!(tracker.tick(t0 + ms(2_100)), vec!["alice".to_string()]);
        assert!(!tracker.is_speaking("alice"));
        // Exactly once
        assert!(tracker.tick(t0 + ms(5_000)).is_empty());
    }

    #[test]
    fn test_repeated_start_keeps_speaking_without_flicker() {
        let mut tracker = SpeakingTracker::new(SpeakingConfig::default());
        let t0 = Instant::now();

        assert!(tracker.voice_start("alice", t0));
        let mut transitions = 0;
        for step in 1..=10 {
            let now = t0 + ms(step * 1_500);
            transitions += tracker.tick(now).len();
            if tracker.voice_start("alice", now) {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 0);
        assert!(tracker.is_speaking("alice"));

        // 15s in, last start at 15s: silent at 17s
        assert_eq!(tracker.tick(t0 + ms(17_000)).len(), 1);
    }

    #[test]
    fn test_voice_end_uses_grace_delay() {
        let mut tracker = SpeakingTracker::new(SpeakingConfig::default());
        let t0 = Instant::now();

        tracker.voice_start("bob", t0);
        assert!(tracker.voice_end("bob", t0 + ms(100)));
        assert!(tracker.tick(t0 + ms(599)).is_empty());
        assert_eq!(tracker.tick(t0 + ms(600)), vec!["bob".to_string()]);

        // voiceEnd for a silent participant is a no-op
        assert!(!tracker.voice_end("bob", t0 + ms(700)));
        assert!(!tracker.is_speaking("bob"));
    }

    #[test]
    fn test_start_during_grace_cancels_end() {
        let mut tracker = SpeakingTracker::new(SpeakingConfig::default());
        let t0 = Instant::now();

        tracker.voice_start("bob", t0);
        tracker.voice_end("bob", t0);
        assert!(!tracker.voice_start("bob", t0 + ms(300)));
        assert!(tracker.tick(t0 + ms(1_000)).is_empty());
        assert!(tracker.is_speaking("bob"));
    }

    #[test]
    fn test_voice_end_never_extends() {
        let mut tracker = SpeakingTracker::new(SpeakingConfig {
            debounce: ms(300),
            grace: ms(500),
        });
        let t0 = Instant::now();
        tracker.voice_start("c", t0);
        tracker.voice_end("c", t0 + ms(100));
        assert_eq!(tracker.next_deadline(), Some(t0 + ms(300)));
    }

    #[test]
    fn test_forget_and_sorted_ids() {
        let mut tracker = SpeakingTracker::new(SpeakingConfig::default());
        let t0 = Instant::now();
        tracker.voice_start("carol", t0);
        tracker.voice_start("alice", t0);
        assert_eq!(tracker.speaking_ids(), vec!["alice", "carol"]);

        assert!(tracker.forget("carol"));
        assert!(!tracker.forget("carol"));
        assert_eq!(tracker.speaking_ids(), vec!["alice"]);

        tracker.clear();
        assert!(tracker.speaking_ids().is_empty());
        assert_eq!(tracker.next_deadline(), None);
    }
}
