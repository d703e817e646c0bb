use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tuner_bridge::{
    config::Config,
    services::{ChannelStore, InMemoryChannelStore, NoopEpgService},
    ssdp::SsdpResponder,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "tuner-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HDHomeRun tuner emulation bridge exposing IPTV sources to Plex")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("tuner_bridge={}", cli.log_level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tuner-bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    // Fatal when the channel database stays unreachable past the retry
    // budget; a missing file just means an empty lineup.
    let channels = Arc::new(
        InMemoryChannelStore::load_from_dir(
            &config.storage.data_dir,
            config.storage.channel_load_retries,
        )
        .await?,
    );
    info!(
        "Channel store ready with {} enabled channels",
        channels.list_enabled().await.len()
    );

    let xmltv_url = format!(
        "http://{}:{}/xmltv/guide.xml",
        config.web.host, config.web.port
    );
    let epg = Arc::new(NoopEpgService::new(xmltv_url));

    let ssdp = SsdpResponder::new(&config);

    let state = AppState::from_parts(config, channels, epg);
    let web_server = WebServer::new(state.clone())?;

    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );

    // Signal channel so background services start only after a successful
    // bind, and a bind failure exits non-zero immediately.
    let (server_ready_tx, server_ready_rx) = tokio::sync::oneshot::channel();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = web_server.serve_with_signal(server_ready_tx).await {
            tracing::error!("Web server failed: {}", e);
        }
    });

    match server_ready_rx.await {
        Ok(Ok(())) => {
            info!("Web server is listening, starting background services");
        }
        Ok(Err(bind_error)) => {
            tracing::error!("Failed to bind web server: {}", bind_error);
            return Err(bind_error);
        }
        Err(_) => {
            tracing::error!("Web server task completed without signaling");
            return Err(anyhow::anyhow!("Web server failed to start"));
        }
    }

    state.start_background_tasks();
    let _ssdp_handles = ssdp.start();
    info!("All services started successfully");

    server_handle.await?;

    Ok(())
}
