use clap::Parser;
use client::config::ClientConfig;
use client::coordinator::{self, GameEvent};
use log::info;
use shared::interpolation::DEFAULT_RENDER_DELAY_MS;
use shared::DEFAULT_PORT;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server endpoints, separated by '|'
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    /// Port used for endpoints without one
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    default_port: u16,

    /// Player name sent to the server
    #[arg(short = 'n', long, default_value = "Player")]
    name: String,

    /// Ticks per second
    #[arg(short = 't', long, default_value = "60")]
    tick_rate: u32,

    /// Interpolation delay for remote actors in milliseconds
    #[arg(short = 'd', long, default_value_t = DEFAULT_RENDER_DELAY_MS)]
    render_delay: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        server: args.server,
        default_port: args.default_port,
        player_name: args.name,
        tick_rate: args.tick_rate,
        render_delay_ms: args.render_delay,
        ..ClientConfig::default()
    };

    let mut interval_timer = interval(config.tick_duration());
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut client = coordinator::connect(config)?;
    let start = Instant::now();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                client.tick(start.elapsed().as_millis() as i64);
                while let Some(event) = client.poll_event() {
                    if let GameEvent::Disconnected(reason) = event {
                        info!("Connection closed: {}", reason);
                        return Ok(());
                    }
                    info!("{:?}", event);
                }
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, disconnecting");
                break;
            }
        }
    }

    Ok(())
}
