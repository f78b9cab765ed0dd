use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::coordinator;
use shared::packets::GameMode;
use shared::DEFAULT_PORT;
use tokio::time::{interval, MissedTickBehavior};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// UDP port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Ticks per second
    #[clap(short, long, default_value = "30")]
    tick_rate: u32,
    /// Maximum number of players
    #[clap(short, long, default_value = "32")]
    max_players: u32,
    /// Episode to load
    #[clap(long, default_value = "unknown")]
    episode: String,
    /// Level to load
    #[clap(long, default_value = "unknown")]
    level: String,
    /// Game mode (battle, teambattle, ctf, race, teamrace, treasurehunt, coop)
    #[clap(short, long, default_value = "battle")]
    game_mode: GameMode,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        tick_rate: args.tick_rate,
        max_players: args.max_players,
        episode: args.episode,
        level: args.level,
        game_mode: args.game_mode,
        ..ServerConfig::default()
    };

    let mut interval_timer = interval(config.tick_duration());
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut server = match coordinator::start(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => server.tick(),
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    Ok(())
}
