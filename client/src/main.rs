use clap::Parser;
use client::network::Bot;
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:25565")]
    server: String,

    /// Player name to log in as
    #[arg(short = 'n', long, default_value = "Bot")]
    name: String,

    /// Name verification key from the heartbeat service
    #[arg(short = 'k', long, default_value = "")]
    key: String,

    /// Chat message to send once logged in
    #[arg(short = 'm', long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    let mut bot = Bot::connect(&args.server).await?;
    bot.login(&args.name, &args.key).await?;

    if let Some(dimensions) = bot.state().dimensions() {
        info!(
            "Map is {}x{}x{}, spawned at {:?}",
            dimensions.x,
            dimensions.y,
            dimensions.z,
            bot.state().position.block()
        );
    }
    if let Some(message) = &args.message {
        bot.send_chat(message).await?;
    }

    tokio::select! {
        result = bot.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, disconnecting"),
    }

    Ok(())
}
