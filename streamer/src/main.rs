mod adaptive;
mod beacon;
mod capture;
mod context;
mod encoder;
mod queue;
mod server;
mod session;
mod source;
#[cfg(test)]
mod testing;

use camlink_common::config::Config;
use camlink_common::frame::FramePool;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use context::StreamingContext;
use source::CameraSource;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = %config.stream.mode,
        source = ?config.capture.source,
        pool_size = config.capture.pool_size,
        "starting camlink streamer"
    );

    let cancel = CancellationToken::new();
    let pool = FramePool::new(config.capture.pool_size);
    let camera = match CameraSource::from_config(&config.capture, pool, cancel.clone()) {
        Ok(camera) => camera,
        Err(e) => {
            error!(error = %e, "failed to open frame source");
            std::process::exit(1);
        }
    };

    let server_config = config.server.clone();
    let beacon = config.beacon.enabled.then(|| config.beacon.clone());
    let ctx = StreamingContext::new(config, camera, cancel.clone());
    let capture_task = ctx.start();

    if let Some(beacon_config) = beacon {
        tokio::spawn(beacon::run_beacon(beacon_config, cancel.clone()));
    }

    let addr = format!("{}:{}", server_config.bind_addr, server_config.port);
    let listener = match server::bind_listener(&server_config).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!(
        addr,
        keep_alive_idle_secs = server_config.keep_alive_idle_secs,
        keep_alive_interval_secs = server_config.keep_alive_interval_secs,
        keep_alive_retries = server_config.keep_alive_retries,
        "HTTP server listening"
    );

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received Ctrl-C, shutting down");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
            }
        }
    });

    let app = server::router(std::sync::Arc::clone(&ctx));
    let shutdown = cancel.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!(error = %e, "HTTP server failed");
    }

    // Covers a server error as well as Ctrl-C
    ctx.shutdown();
    if let Some(task) = capture_task {
        if let Err(e) = task.await {
            error!(error = %e, "capture task panicked");
        }
    }
    info!(status = ?ctx.status(), "camlink streamer stopped");
}
