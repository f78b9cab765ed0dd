//! Server settings, filled from the command line by the binary.

use shared::packets::GameMode;
use shared::{Error, Result, Vector2f, DEFAULT_PORT, PROTOCOL_VERSION};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Snapshots per second.
    pub tick_rate: u32,
    pub max_players: u32,
    pub episode: String,
    pub level: String,
    pub game_mode: GameMode,
    /// Picked at random for joining players; `default_spawn` when empty.
    pub spawn_points: Vec<Vector2f>,
    pub default_spawn: Vector2f,
    pub player_health: u8,
    pub player_metadata: String,
    pub protocol_version: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tick_rate: 30,
            max_players: 32,
            episode: "unknown".to_string(),
            level: "unknown".to_string(),
            game_mode: GameMode::Battle,
            spawn_points: Vec::new(),
            default_spawn: Vector2f::new(64.0, 64.0),
            player_health: 5,
            player_metadata: "Interactive/Player".to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::NoEndpoints(format!("{}:{}", self.host, self.port)))
    }
}
