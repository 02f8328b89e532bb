use clap::Parser;
use log::{error, info};
use server::{Server, ServerConfig, VerifyNames};
use std::path::PathBuf;

/// Main-method of the application.
/// Loads the configuration, starts the server and runs until Ctrl+C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Command line arguments; anything given here overrides the config file
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Path to a TOML configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Server IP address to bind to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Server port to listen on
        #[clap(short, long)]
        port: Option<u16>,
        /// Server name shown while the map loads
        #[clap(long)]
        server_name: Option<String>,
        /// Message of the day shown under the server name
        #[clap(long)]
        motd: Option<String>,
        /// Maximum number of players online
        #[clap(short, long)]
        max_players: Option<usize>,
        /// Name verification policy
        #[clap(long, value_enum)]
        verify_names: Option<VerifyNames>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if args.host.is_some() || args.port.is_some() {
        let (default_host, default_port) = config
            .bind
            .rsplit_once(':')
            .map(|(host, port)| (host.to_string(), port.parse().unwrap_or(25565)))
            .unwrap_or_else(|| (config.bind.clone(), 25565));
        config.bind = format!(
            "{}:{}",
            args.host.unwrap_or(default_host),
            args.port.unwrap_or(default_port)
        );
    }
    if let Some(server_name) = args.server_name {
        config.server_name = server_name;
    }
    if let Some(motd) = args.motd {
        config.motd = motd;
    }
    if let Some(max_players) = args.max_players {
        config.max_players = max_players;
    }
    if let Some(policy) = args.verify_names {
        config.verify_names = policy;
    }

    let mut server = Server::with_memory_backends(config)?;
    server.start()?;
    info!("Name verification salt: {}", server.salt());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");

    tokio::task::spawn_blocking(move || server.shutdown()).await?;
    Ok(())
}
