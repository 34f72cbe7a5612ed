//! # MJPEG streaming server
//!
//! Serves camera frames to authenticated viewers as a
//! `multipart/x-mixed-replace` stream over TLS.
//!
//! ## Features
//! - TLS from a PKCS#12 key store using `tokio-rustls`
//! - HTTP Basic authentication with per-address rate limiting
//! - Client ceilings and maximum connection durations
//! - Environment-based configuration loading
//! - Health monitoring via HTTP metrics endpoint
//!
//! Frames are read from the JPEG file or directory named by
//! `MJPEG_FRAME_SOURCE`; without one the server accepts viewers but sends nothing.

use anyhow::Context;
use mjpeg_rs::{
    config::ServerConfig,
    server::{health, EnvSecretStore, Frame, StartOutcome, StreamServer},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const FRAME_SOURCE_VAR: &str = "MJPEG_FRAME_SOURCE";

/// Entry point for the streaming server.
///
/// Initializes logging, loads configuration from the environment, starts the
/// TLS listener and feeds frames until Ctrl+C.
///
/// # Errors
/// Returns an error if configuration validation fails or the server cannot start.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;
    config.validate()?;
    let metrics_port = config.metrics_port;

    let server = Arc::new(StreamServer::new(config, Arc::new(EnvSecretStore)));
    match server.start().await.context("failed to start streaming server")? {
        StartOutcome::Started(addr) => info!("Streaming on https://{}", addr),
        other => warn!("Unexpected start outcome: {:?}", other),
    }

    if let Some(port) = metrics_port {
        tokio::spawn(health::serve_metrics_http(server.clone(), port));
    }

    let producer = match std::env::var_os(FRAME_SOURCE_VAR) {
        Some(source) => {
            let frames = load_frames(Path::new(&source))
                .with_context(|| format!("failed to load frames from {:?}", source))?;
            info!("Loaded {} frame(s) from {:?}", frames.len(), source);
            Some(tokio::spawn(produce_frames(server.clone(), frames)))
        }
        None => {
            warn!("{} not set, no frames will be sent", FRAME_SOURCE_VAR);
            None
        }
    };

    shutdown_signal().await;
    info!("Shutting down gracefully");
    if let Some(producer) = producer {
        producer.abort();
    }
    server.stop().await;

    Ok(())
}

/// Cycles through `frames` at the configured stream delay, skipping the
/// broadcast entirely while nobody is connected.
async fn produce_frames(server: Arc<StreamServer>, frames: Vec<Frame>) {
    if frames.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(server.config().stream_delay().max(std::time::Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    for frame in frames.iter().cycle() {
        ticker.tick().await;
        if !server.has_active_clients() {
            continue;
        }
        if let Some(report) = server.offer_frame(frame).await {
            if report.skipped > 0 {
                debug!("{} slow client(s) skipped a frame", report.skipped);
            }
        }
    }
}

/// Reads one JPEG file, or every `.jpg`/`.jpeg` file of a directory in name order.
fn load_frames(source: &Path) -> anyhow::Result<Vec<Frame>> {
    let mut paths: Vec<PathBuf> = if source.is_dir() {
        std::fs::read_dir(source)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect()
    } else {
        vec![source.to_path_buf()]
    };
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let (width, height) = jpeg_dimensions(&data).unwrap_or_else(|| {
            error!("No frame header found in {}", path.display());
            (0, 0)
        });
        frames.push(Frame::new(data, width, height));
    }
    Ok(frames)
}

/// Width and height from the first start-of-frame marker.
fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        // SOF0..SOF15, excluding DHT, JPG and DAC
        if (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            let sof = data.get(pos + 5..pos + 9)?;
            let height = u16::from_be_bytes([sof[0], sof[1]]) as u32;
            let width = u16::from_be_bytes([sof[2], sof[3]]) as u32;
            return Some((width, height));
        }
        pos += 2 + len;
    }
    None
}

/// Listens for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
