use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use courier::cli::{self, Cli, Commands};
use courier::config::{Config, StorageBackend};
use courier::store::{MemoryStore, RedisStore, StoreHandle};
use courier::telemetry::Telemetry;
use courier::transport::SocketHub;
use courier::websocket::{router, AppState};
use courier::Courier;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Call {
        url,
        uid,
        event,
        payload,
        listen,
    }) = cli.command
    {
        tracing_subscriber::fmt().with_target(false).init();
        if let Err(e) = cli::run_call_client(url, uid, event, payload, listen).await {
            error!("Call failed: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = Config::try_from(cli.server)?;
    let telemetry = Telemetry::init(&config.log_filter)?;
    info!(
        listen_addr = %config.listen_addr,
        storage = ?config.storage,
        ack_timeout_ms = config.delivery.ack_timeout.as_millis() as u64,
        flush_batch_size = config.delivery.flush_batch_size,
        "starting courier"
    );

    let store: StoreHandle = match config.storage {
        StorageBackend::Memory => MemoryStore::new(),
        StorageBackend::Redis => Arc::new(
            RedisStore::connect(&config.redis_url, &config.key_prefix)
                .await
                .with_context(|| format!("failed to connect to redis at {}", config.redis_url))?,
        ),
    };

    let hub = SocketHub::new();
    let courier = Courier::new(hub.clone(), store, config.delivery.clone());
    let app = router(AppState {
        courier,
        hub,
        metrics: Some(telemetry.metrics_handle()),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("courier listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
