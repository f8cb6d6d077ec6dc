//! # Configuration Management
//!
//! This module handles loading the room server's configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (APP__SERVER__PORT, APP__ROOMS__MAX_PARTICIPANTS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The separator between nesting levels is a double underscore, so snake_case field
//! names survive: `APP__WEBSOCKET__CLIENT_TIMEOUT_SECS` maps to `websocket.client_timeout_secs`.
//!
//! The session client has its own, smaller configuration in [`crate::client::config`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main server configuration.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, rooms, websocket, voice)
/// keeps each concern readable on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rooms: RoomsConfig,
    pub websocket: WebSocketConfig,
    pub voice: VoiceConfig,
}

/// Server bind settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Room lifecycle settings.
///
/// ## Fields:
/// - `default_room`: room used when a `join` names none
/// - `max_participants`: membership cap per room
/// - `idle_close_secs`: how long an empty room keeps its chat log and whiteboard
///   before closing, so a reconnecting participant finds them again
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    pub default_room: String,
    pub max_participants: usize,
    pub idle_close_secs: u64,
}

/// WebSocket connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Seconds between server pings
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence from the client before the connection is dropped
    pub client_timeout_secs: u64,
    /// Largest accepted WebSocket frame
    pub max_frame_bytes: usize,
}

/// Voice relay settings. The server never decodes voice, these only bound it.
///
/// `sample_rate` and `channels` are reported by the health endpoint so clients can check
/// they capture at the rate everyone else plays back at. There is no negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Base64 payloads longer than this are dropped
    pub max_payload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            rooms: RoomsConfig {
                default_room: "classroom".to_string(),
                max_participants: 64,
                idle_close_secs: 60,
            },
            websocket: WebSocketConfig {
                heartbeat_interval_secs: 5,
                client_timeout_secs: 15,
                max_frame_bytes: 1024 * 1024, // whiteboard images travel inline
            },
            voice: VoiceConfig {
                sample_rate: 44_100,
                channels: 1,
                max_payload_bytes: 64 * 1024,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__ROOMS__DEFAULT_ROOM=lobby`: Override the default room
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Default room name is not blank
    /// - Rooms admit at least one participant
    /// - Heartbeat and client timeout are positive, and the timeout is longer than the
    ///   heartbeat (otherwise every client times out between two pings)
    /// - Frame and payload limits are positive
    /// - Sample rate and channel count are positive
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.rooms.default_room.trim().is_empty() {
            return Err(anyhow::anyhow!("Default room name cannot be empty"));
        }

        if self.rooms.max_participants == 0 {
            return Err(anyhow::anyhow!("Max participants must be greater than 0"));
        }

        if self.websocket.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.websocket.client_timeout_secs <= self.websocket.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.websocket.client_timeout_secs,
                self.websocket.heartbeat_interval_secs
            ));
        }

        if self.websocket.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.voice.sample_rate == 0 || self.voice.channels == 0 {
            return Err(anyhow::anyhow!("Sample rate and channel count must be greater than 0"));
        }

        if self.voice.max_payload_bytes == 0 {
            return Err(anyhow::anyhow!("Max voice payload must be greater than 0"));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.websocket.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.websocket.client_timeout_secs)
    }

    pub fn idle_close(&self) -> Duration {
        Duration::from_secs(self.rooms.idle_close_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.voice.sample_rate, 44_100);
        assert_eq!(config.voice.channels, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rooms.max_participants = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rooms.default_room = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_must_exceed_heartbeat() {
        let mut config = AppConfig::default();
        config.websocket.heartbeat_interval_secs = 10;
        config.websocket.client_timeout_secs = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat"));

        config.websocket.client_timeout_secs = 11;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_helpers() {
        let config = AppConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.client_timeout(), Duration::from_secs(15));
        assert_eq!(config.idle_close(), Duration::from_secs(60));
    }
}
