//! Client-side mirror of the room whiteboard.
//!
//! Last-delivered-wins: whatever `whiteboardUpdate` arrives last replaces the mirror, even
//! if it was written before an update already applied. The server applies writes in its
//! own arrival order and delivers them in that order, so the mirror only disagrees with the
//! server transiently.

use crate::protocol::WhiteboardState;

#[derive(Debug, Default, Clone)]
pub struct WhiteboardMirror {
    current: Option<WhiteboardState>,
}

impl WhiteboardMirror {
    /// Replace the mirror with the snapshot delivered at join.
    pub fn reset(&mut self, snapshot: Option<WhiteboardState>) {
        self.current = snapshot;
    }

    /// Apply a live update. Returns whether the visible image changed.
    pub fn apply(&mut self, update: WhiteboardState) -> bool {
        let changed = self.image_reference() != Some(update.image_reference.as_str());
        self.current = Some(update);
        changed
    }

    pub fn image_reference(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.image_reference.as_str())
    }

    pub fn state(&self) -> Option<&WhiteboardState> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn board(reference: &str, by: &str) -> WhiteboardState {
        WhiteboardState {
            image_reference: reference.to_string(),
            updated_by: by.to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_last_delivered_wins() {
        let mut mirror = WhiteboardMirror::default();
        assert_eq!(mirror.image_reference(), None);

        assert!(mirror.apply(board("A", "alice")));
        assert!(mirror.apply(board("B", "bob")));
        assert_eq!(mirror.image_reference(), Some("B"));

        // An older write delivered later still wins
        let mut stale = board("C", "carol");
        stale.updated_at = Utc::now() - Duration::seconds(60);
        assert!(mirror.apply(stale));
        assert_eq!(mirror.image_reference(), Some("C"));
    }

    #[test]
    fn test_same_image_is_not_a_change() {
        let mut mirror = WhiteboardMirror::default();
        mirror.apply(board("A", "alice"));
        assert!(!mirror.apply(board("A", "bob")));
        assert_eq!(mirror.state().map(|s| s.updated_by.as_str()), Some("bob"));
    }

    #[test]
    fn test_reset_from_snapshot() {
        let mut mirror = WhiteboardMirror::default();
        mirror.apply(board("A", "alice"));
        mirror.reset(None);
        assert_eq!(mirror.image_reference(), None);
        mirror.reset(Some(board("Z", "zed")));
        assert_eq!(mirror.image_reference(), Some("Z"));
        mirror.clear();
        assert!(mirror.state().is_none());
    }
}
