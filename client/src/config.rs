//! Client settings.

use shared::interpolation::DEFAULT_RENDER_DELAY_MS;
use shared::{DEFAULT_PORT, PROTOCOL_VERSION};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint list, `|` separated; tried in order
    pub server: String,
    /// Used for endpoints without an explicit port
    pub default_port: u16,
    pub player_name: String,
    pub tick_rate: u32,
    pub render_delay_ms: i64,
    pub protocol_version: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            default_port: DEFAULT_PORT,
            player_name: "Player".to_string(),
            tick_rate: 60,
            render_delay_ms: DEFAULT_RENDER_DELAY_MS,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ClientConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}
