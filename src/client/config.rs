//! # Client Configuration
//!
//! Settings for one session client, loaded the same way as the server's:
//! defaults → optional `client.toml` → `CLIENT__*` environment variables.
//!
//! ## Environment Variable Examples:
//! - `CLIENT__SERVER_URL=ws://classroom.example:8080/ws/room`
//! - `CLIENT__DISPLAY_NAME=Alice`
//! - `CLIENT__ROOM=physics`

use crate::audio::VadConfig;
use crate::client::speaking::SpeakingConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `ws://` or `wss://` URL of the room endpoint
    pub server_url: String,
    pub display_name: String,
    /// Empty means the server's default room
    pub room: String,

    /// How long to wait for `joined` before counting the attempt as failed
    pub join_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Speaking indicator debounce after the last `voiceStart`
    pub speaking_debounce_ms: u64,
    /// Delay between `voiceEnd` and the indicator going silent
    pub speaking_grace_ms: u64,
    /// How often speaking timers are evaluated
    pub tick_interval_ms: u64,

    pub sample_rate: u32,
    /// Samples per captured buffer
    pub frame_size: usize,
    pub vad_threshold: f32,
    pub vad_hold_ms: u64,
    pub voice_refresh_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws/room".to_string(),
            display_name: "guest".to_string(),
            room: String::new(),
            join_timeout_ms: 5_000,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 8_000,
            max_reconnect_attempts: 5,
            speaking_debounce_ms: 2_000,
            speaking_grace_ms: 500,
            tick_interval_ms: 100,
            sample_rate: 44_100,
            frame_size: 2_048, // ~46 ms at 44.1 kHz
            vad_threshold: 0.02,
            vad_hold_ms: 400,
            voice_refresh_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default())?)
            .add_source(config::File::with_name("client").required(false))
            .add_source(
                config::Environment::with_prefix("CLIENT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Server URL must start with ws:// or wss://, got '{}'",
                self.server_url
            ));
        }

        if self.display_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Display name cannot be empty"));
        }

        if self.join_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("Join timeout and tick interval must be greater than 0"));
        }

        if self.reconnect_base_delay_ms == 0
            || self.reconnect_max_delay_ms < self.reconnect_base_delay_ms
        {
            return Err(anyhow::anyhow!(
                "Reconnect delays must be positive with max >= base"
            ));
        }

        if self.speaking_grace_ms > self.speaking_debounce_ms {
            return Err(anyhow::anyhow!(
                "Speaking grace ({}ms) cannot exceed the debounce window ({}ms)",
                self.speaking_grace_ms,
                self.speaking_debounce_ms
            ));
        }

        if self.sample_rate == 0 || self.frame_size == 0 {
            return Err(anyhow::anyhow!("Sample rate and frame size must be greater than 0"));
        }

        if !(0.0..1.0).contains(&self.vad_threshold) {
            return Err(anyhow::anyhow!("VAD threshold must be within [0.0, 1.0)"));
        }

        Ok(())
    }

    /// Room to request in `join`, `None` for the server default.
    pub fn room_id(&self) -> Option<String> {
        let room = self.room.trim();
        (!room.is_empty()).then(|| room.to_string())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): doubles from the base delay up
    /// to the max delay.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn speaking(&self) -> SpeakingConfig {
        SpeakingConfig {
            debounce: Duration::from_millis(self.speaking_debounce_ms),
            grace: Duration::from_millis(self.speaking_grace_ms),
        }
    }

    pub fn vad(&self) -> VadConfig {
        VadConfig {
            threshold: self.vad_threshold,
            hold: Duration::from_millis(self.vad_hold_ms),
            refresh: Duration::from_millis(self.voice_refresh_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.room_id(), None);
        assert_eq!(config.speaking().debounce, Duration::from_millis(2_000));
        assert_eq!(config.speaking().grace, Duration::from_millis(500));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.server_url = "http://127.0.0.1:8080".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.display_name = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.speaking_grace_ms = 3_000;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.reconnect_max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_backoff_schedule() {
        let config = ClientConfig::default();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| config.reconnect_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![250, 500, 1_000, 2_000, 4_000, 8_000, 8_000]);
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(250));
        assert_eq!(config.reconnect_delay(u32::MAX), Duration::from_millis(8_000));
    }

    #[test]
    fn test_room_id_trims() {
        let config = ClientConfig {
            room: "  physics ".to_string(),
            ..ClientConfig::default()
        };
        assert_eq!(config.room_id(), Some("physics".to_string()));
    }
}
