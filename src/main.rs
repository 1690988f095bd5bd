use std::sync::Arc;

use media_relay::{
    ApiError, AppState, Config, build_router, extractor::YtDlp, store::FileStore,
    transcode::Ffmpeg,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env().map_err(|error| ApiError::internal(error.to_string()))?;

    let store = Arc::new(FileStore::new(&config.output_dir));
    store.ensure_root().await.map_err(|error| {
        ApiError::internal(format!(
            "Could not create download directory {:?}: {error}",
            config.output_dir
        ))
    })?;

    let yt_dlp = Arc::new(YtDlp::new(&config.yt_dlp_bin, config.extractor_timeout));
    let ffmpeg = Arc::new(Ffmpeg::new(&config.ffmpeg_bin, config.transcode_timeout));

    if config.file_retention.is_zero() && config.max_store_bytes == 0 {
        warn!("FILE_RETENTION_SECONDS=0 and MAX_STORE_BYTES=0: downloads are never evicted.");
    }
    Arc::clone(&store).spawn_sweeper(
        config.sweep_interval,
        config.file_retention,
        config.max_store_bytes,
    );

    let state = AppState::new(&config, yt_dlp.clone(), yt_dlp, ffmpeg, store);
    let app = build_router(state, &config)?;

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!(
        "Media relay listening on http://{} (downloads in {:?}, transcode {:?})",
        config.bind_addr, config.output_dir, config.transcode
    );

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
