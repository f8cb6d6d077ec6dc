//! Room server core: the per-room state machine and the actors that serialize access to it.

pub mod registry;
pub mod room;

pub use registry::{open_and_join, JoinError, RoomActor, RoomRegistry};
pub use room::{JoinSnapshot, Outbox, Room, RoomError, RoomSummary};
