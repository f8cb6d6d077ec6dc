//! # Classroom Session
//!
//! Real-time classroom collaboration: participants join a named room and share voice,
//! speaking indicators, a whiteboard image and a text chat with history replay.
//!
//! ## Application Architecture:
//! - **server**: room state and the per-room actors that serialize every mutation
//! - **websocket**: one actor per participant connection, bridging frames to its room
//! - **protocol**: the JSON messages exchanged over the socket
//! - **health**: health, metrics and room listing endpoints
//! - **config** / **state** / **error**: server configuration, shared state, error types
//! - **audio**: capture, voice codec, voice activity detection and per-peer playback
//! - **client**: the session client (transport loop, speaking tracker, whiteboard mirror)

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod protocol;
pub mod server;
pub mod state;
pub mod websocket;

use actix_web::web;

/// Register every HTTP and WebSocket route.
///
/// Shared by the server binary and the integration tests so both serve the same surface.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/room", web::get().to(websocket::room_websocket))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/rooms", web::get().to(health::list_rooms))
                .route("/rooms/{room}", web::get().to(health::get_room)),
        )
        // Also provide health check at root level for convenience
        .route("/health", web::get().to(health::health_check));
}
