use anyhow::Context;
use clap::Parser;
use log::{error, info};
use relaypoint::config::Config;
use relaypoint::point::Point;
use std::net::IpAddr;

#[derive(Parser)]
#[command(name = "relaypoint")]
#[command(about = "A proxy point relaying one inbound protocol through one outbound transport")]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// IP address to bind to
    #[arg(long)]
    host: Option<IpAddr>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path).with_context(|| format!("loading {}", config_path))?
    } else {
        Config::default()
    };

    // Override config with command line arguments
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    if let Some(host) = args.host {
        config.point.host = host;
    }
    if let Some(port) = args.port {
        config.point.port = port;
    }
    config.validate().context("invalid configuration")?;

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level))
        .init();

    info!("Configuration:");
    info!("  Host: {}", config.point.host);
    info!("  Port: {}", config.point.port);
    info!("  Inbound: {}", config.point.inbound.protocol);
    info!("  Outbound: {}", config.point.outbound.protocol);
    info!("  Buffer size: {}", config.point.buffer.size);

    let point = Point::new(config.point.clone()).context("building point")?;
    if let Err(e) = point.start().await {
        error!("Point failed to start: {}", e);
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    point.close();

    Ok(())
}
