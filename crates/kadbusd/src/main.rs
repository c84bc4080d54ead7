use anyhow::{Context, Result};
use clap::Parser;
use kadbusd::{AppContext, Config};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kadbusd", version, about = "Kademlia DHT with publish/subscribe")]
struct Args {
    /// Configuration file
    #[arg(long, short, env = "KADBUSD_CONFIG", default_value = "kadbusd.yaml")]
    config: PathBuf,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,

    /// Log level, overriding logging.level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(&args.config)?;
        println!("Configuration written to {}", config.config_path().display());
        return Ok(());
    }

    let config = Config::load(&args.config)?;
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level, config.logging.json)?;

    info!("kadbusd v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config.config_path().display());

    let context = AppContext::start(config).await?;
    info!("Daemon ready. Press Ctrl+C to stop.");

    context.wait_for_shutdown().await;
    context.shutdown().await
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level {}", level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
