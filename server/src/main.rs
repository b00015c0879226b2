use clap::Parser;
use env_logger::Env;
use log::{error, info};
use realm_server::{GameServer, ServerConfig};
use realm_shared::DEFAULT_PORT;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Server port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Milliseconds between world ticks
    #[clap(short, long, default_value = "16")]
    tick_ms: u64,
    /// Maximum concurrent sessions
    #[clap(short, long, default_value = "1024")]
    max_sessions: usize,
    /// Seconds a deposited login handoff stays claimable
    #[clap(long, default_value = "120")]
    handoff_timeout_secs: u64,
    /// Address of the login center allowed to deposit handoffs
    #[clap(long, default_value = "127.0.0.1")]
    trusted_center: IpAddr,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: SocketAddr::new(args.host, args.port),
            tick_interval: Duration::from_millis(args.tick_ms),
            max_sessions: args.max_sessions,
            handoff_timeout: Duration::from_secs(args.handoff_timeout_secs),
            trusted_center: args.trusted_center,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig::from(args);
    info!(
        "Starting realm server on {} ({:?} ticks, {} max sessions)",
        config.bind_addr, config.tick_interval, config.max_sessions
    );

    let mut server = GameServer::new(config);
    if let Err(e) = server.start().await {
        error!("Server failed to start: {}", e);
        return Err(e.into());
    }

    let shutdown = server.shutdown_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down gracefully..."),
        _ = shutdown.cancelled() => info!("Shutdown requested by the world"),
    }

    let stats = server.stats();
    server.stop().await?;
    info!(
        "Served {} bytes out, {} bytes in",
        stats.bytes_sent, stats.bytes_received
    );
    Ok(())
}
