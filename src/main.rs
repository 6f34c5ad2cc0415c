//! MJPEG camera streaming server

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cctv_streamer::camera::{probe_devices, DeviceOpener};
use cctv_streamer::config::SourceKind;
use cctv_streamer::{run_server, AppState, CaptureLoop, CaptureStats, Config, FrameSlot, VideoControl};

#[derive(Parser, Debug)]
#[command(name = "cctv_streamer")]
#[command(about = "Multi-client MJPEG streaming server for a single USB camera")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera device index (/dev/videoN). Default 0.
    #[arg(long)]
    camera: Option<u32>,

    /// Capture width. Default 640.
    #[arg(long)]
    width: Option<u32>,

    /// Capture height. Default 480.
    #[arg(long)]
    height: Option<u32>,

    /// Target frame rate. Default 30.
    #[arg(long)]
    fps: Option<u32>,

    /// Address to bind the web server to. Default 0.0.0.0.
    #[arg(long)]
    host: Option<String>,

    /// Web server port. Default 5000.
    #[arg(long)]
    port: Option<u16>,

    /// JPEG quality (1-100) for frames the camera does not compress itself
    #[arg(long)]
    quality: Option<u8>,

    /// Stream a synthetic test pattern instead of a real camera
    #[arg(long)]
    test_pattern: bool,

    /// Do not start capturing at launch
    #[arg(long)]
    no_autostart: bool,

    /// Address advertised in stream URLs. Default auto-detect.
    #[arg(long)]
    public_ip: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan camera indices and test-capture a few frames from each one found
    Probe {
        /// Number of device indices to try, starting at 0
        #[arg(long, default_value_t = 10)]
        max_index: u32,

        /// Frames to capture from each camera
        #[arg(long, default_value_t = 5)]
        frames: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let config = load_config(&cli)?;

    match cli.command {
        Some(Command::Probe { max_index, frames }) => probe(config, max_index, frames).await,
        None => serve(config, !cli.no_autostart).await,
    }
}

/// Configuration file (if any) with command-line overrides applied
fn load_config(cli: &CliArgs) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            Config::load(path).with_context(|| format!("failed to load {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(index) = cli.camera {
        config.camera.device_index = index;
    }
    if let Some(width) = cli.width {
        config.camera.width = width;
    }
    if let Some(height) = cli.height {
        config.camera.height = height;
    }
    if let Some(fps) = cli.fps {
        config.camera.fps = fps;
    }
    if let Some(quality) = cli.quality {
        config.camera.quality = quality;
    }
    if cli.test_pattern {
        config.camera.source = SourceKind::TestPattern;
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ip) = &cli.public_ip {
        config.server.public_ip = Some(ip.clone());
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn probe(config: Config, max_index: u32, frames: u32) -> Result<()> {
    info!(max_index, frames, "Probing cameras");

    let camera = config.camera.clone();
    let timeout = config.capture.read_timeout();
    let reports = tokio::task::spawn_blocking(move || {
        probe_devices(&DeviceOpener, &camera, max_index, frames, timeout)
    })
    .await?;

    let mut working = 0;
    for report in &reports {
        match &report.source {
            Some(source) if report.frames_ok > 0 => {
                working += 1;
                info!(
                    index = report.device_index,
                    source = %source,
                    ok = report.frames_ok,
                    failed = report.frames_failed,
                    "Camera working"
                );
            }
            Some(source) => warn!(
                index = report.device_index,
                source = %source,
                error = report.error.as_deref().unwrap_or("no frames"),
                "Camera opens but returns no frames"
            ),
            None => info!(
                index = report.device_index,
                reason = report.error.as_deref().unwrap_or("unknown"),
                "No camera"
            ),
        }
    }

    if working == 0 {
        bail!("no working camera found in indices 0..{}", max_index);
    }
    info!(working, "Probe finished");
    Ok(())
}

async fn serve(config: Config, autostart: bool) -> Result<()> {
    let config = Arc::new(config);

    info!(
        device = %config.camera.device_path(),
        source = ?config.camera.source,
        resolution = %format!("{}x{}", config.camera.width, config.camera.height),
        fps = config.camera.fps,
        "CCTV streamer starting"
    );

    let capture = Arc::new(CaptureLoop::new(
        config.camera.clone(),
        config.capture.clone(),
        Arc::new(DeviceOpener),
        Arc::new(FrameSlot::new()),
        Arc::new(CaptureStats::new()),
    ));
    let control = VideoControl::new(capture);

    if autostart {
        let starter = control.clone();
        match tokio::task::spawn_blocking(move || starter.request_start()).await? {
            Ok(_) => info!("Camera started"),
            Err(failure) => warn!(
                error = %failure.error,
                "Camera failed to start, control API stays up for a retry"
            ),
        }
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    // Stopping capture first ends every open /video_feed, so graceful
    // shutdown does not wait on them.
    let shutdown = {
        let control = control.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
            if let Err(e) = tokio::task::spawn_blocking(move || control.request_stop()).await {
                error!(error = %e, "Failed to stop capture");
            }
        }
    };

    run_server(listener, AppState::new(control.clone(), config), shutdown).await?;

    tokio::task::spawn_blocking(move || control.request_stop()).await?;
    info!("Shutdown complete");
    Ok(())
}
