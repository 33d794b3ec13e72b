use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use m3u_merger::{
    config::Config,
    processor::PlaylistProcessor,
    proxy::{ConcurrencyManager, LoadBalancer},
    scheduler::Updater,
    streaming::CoordinatorRegistry,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "m3u-merger")]
#[command(version = "0.1.0")]
#[command(about = "An M3U playlist merger and failover stream proxy")]
#[command(long_about = None)]
struct Cli {
    /// Listening IP address (overrides HOST)
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port (overrides PORT)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    // DEBUG=true lowers the default filter unless the CLI already asked
    // for something more specific.
    let level = if config.debug && cli.log_level == "info" {
        "debug".to_string()
    } else {
        cli.log_level
    };
    let log_filter = format!("m3u_merger={}", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting M3U Merger v{}", env!("CARGO_PKG_VERSION"));
    info!("Configured sources: {}", config.sources.len());

    let config = Arc::new(config);
    let processor = Arc::new(PlaylistProcessor::new(config.clone())?);
    let concurrency = Arc::new(ConcurrencyManager::new(&config));
    let balancer = Arc::new(LoadBalancer::new(&config, concurrency)?);
    let registry = Arc::new(CoordinatorRegistry::new(config.streaming.buffer_mb));
    let updater = Arc::new(Updater::new(processor.clone(), config.clone()));

    let shutdown = CancellationToken::new();

    // Boot orchestration runs in the background so the HTTP surface is
    // available immediately; the playlist endpoint serves a bare header
    // until the first sync lands.
    let boot_updater = updater.clone();
    let boot_cancel = shutdown.child_token();
    tokio::spawn(async move {
        boot_updater.boot(boot_cancel).await;
    });

    let schedule_updater = updater.clone();
    let schedule_cancel = shutdown.child_token();
    tokio::spawn(async move {
        schedule_updater.run_schedule(schedule_cancel).await;
    });

    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .build()?;
    let state = AppState {
        config,
        processor,
        balancer,
        registry,
        client,
    };
    let server = WebServer::new(state)?;
    server.serve().await
}
