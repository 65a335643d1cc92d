//! edge_streamd - camera MJPEG streamer with hardware edge detection
//!
//! This daemon:
//! 1. Opens the camera (fatal if it cannot)
//! 2. Prepares the transform device channel
//! 3. Serves the viewer page, the MJPEG stream and the control endpoints
//! 4. Logs pipeline statistics until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use edge_streamer::{
    ControlSurface, DeviceChannel, FramePipeline, FrameSource, PipelineMode, StreamServer,
    StreamerConfig,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream a camera as MJPEG with optional hardware edge detection")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "EDGE_STREAMER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:5000.
    #[arg(long)]
    addr: Option<String>,

    /// Camera device path, or stub://... for the synthetic camera.
    #[arg(long)]
    camera: Option<String>,

    /// Transform device path, or stub://... for the loopback device.
    #[arg(long)]
    device: Option<String>,

    /// Directory snapshots are written to.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = StreamerConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.http_addr = addr;
    }
    if let Some(camera) = args.camera {
        cfg.camera.device = camera;
    }
    if let Some(device) = args.device {
        cfg.device.path = device;
    }
    if let Some(dir) = args.snapshot_dir {
        cfg.snapshot_dir = dir;
    }

    let source = FrameSource::open(&cfg.camera)
        .with_context(|| format!("failed to open camera {}", cfg.camera.device))?;
    let device = Arc::new(DeviceChannel::open(&cfg.device));
    log::info!(
        "transform device {} ({}x{}, timeout {:?})",
        cfg.device.path,
        cfg.device.width,
        cfg.device.height,
        cfg.device.timeout
    );

    let pipeline = Arc::new(FramePipeline::new(
        Arc::new(source),
        device.clone(),
        PipelineMode::new(),
        cfg.pipeline.clone(),
    ));
    let control = Arc::new(ControlSurface::new(
        pipeline.clone(),
        device,
        cfg.snapshot_dir.clone(),
    ));

    let handle = StreamServer::new(cfg.server_config(), pipeline.clone(), control).spawn()?;
    log::info!("edge_streamd listening on http://{}", handle.addr);
    log::info!("snapshots go to {}", cfg.snapshot_dir.display());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    loop {
        match rx.recv_timeout(STATS_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let stats = pipeline.stats();
                let camera = pipeline.source().stats();
                log::info!(
                    "health: mode={} encoded={} transformed={} capture_failures={} transform_failures={} encode_failures={} camera_frames={} camera_failures={}",
                    if pipeline.mode().is_enabled() { "edges" } else { "color" },
                    stats.frames_encoded,
                    stats.transformed_frames,
                    stats.capture_failures,
                    stats.transform_failures,
                    stats.encode_failures,
                    camera.frames_captured,
                    camera.capture_failures
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping stream server...");
    handle.stop()?;
    Ok(())
}
