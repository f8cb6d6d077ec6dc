//! # Session Client
//!
//! Everything a participant's process needs to take part in a room:
//!
//! - **config**: client settings (server URL, display name, timings)
//! - **transport**: the WebSocket connection loop and the [`SessionHandle`] used to drive it
//! - **mirror**: local copy of room state built from server events
//! - **speaking**: debounced per-participant speaking indicators
//! - **whiteboard**: last-delivered-wins whiteboard mirror

pub mod config;
pub mod mirror;
pub mod speaking;
pub mod transport;
pub mod whiteboard;

pub use config::ClientConfig;
pub use mirror::{ClientEvent, PresentationState, SessionMirror};
pub use speaking::{SpeakingConfig, SpeakingTracker};
pub use transport::{SessionChannels, SessionClient, SessionHandle};
pub use whiteboard::WhiteboardMirror;
