use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use raster_convert_rs::config::ServerConfig;
use raster_convert_rs::image_pipeline::{ConversionEngine, FormatRegistry, SinkRegistry};
use raster_convert_rs::logger;
use raster_convert_rs::server::{Dispatcher, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let config = ServerConfig::parse();

    info!("Starting raster-convert...");

    if let Some(cache_dir) = &config.cache_dir {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("creating cache directory {}", cache_dir.display()))?;
        info!("Cache directory: {}", cache_dir.display());
    }

    let conversion = config.conversion_config();
    info!(
        "Tiling planes of {}+ pixels in {}x{} tiles",
        conversion.big_image_threshold, conversion.tile_width, conversion.tile_height
    );
    info!("Compression: {:?}", config.compression);

    let engine = ConversionEngine::new(
        Arc::new(FormatRegistry),
        Arc::new(SinkRegistry::new(config.sink_config())),
        conversion,
    );
    let pool = Arc::new(WorkerPool::new(config.pool_config()));
    let dispatcher = Arc::new(
        Dispatcher::new(Arc::new(engine), pool.clone(), config.connection_limit())
            .with_request_timeout(config.request_timeout()),
    );

    let address = config.address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown.cancel();
    });

    dispatcher.serve(listener, cancel).await?;

    pool.shutdown().await;

    info!("Stopped");
    Ok(())
}
