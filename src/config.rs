use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ServerConfig;
use crate::device::{DeviceConfig, DEVICE_HEIGHT, DEVICE_WIDTH, IOCTL_SET_EDGE_DETECTION};
use crate::ingest::{CameraConfig, RawPixelFormat};
use crate::pipeline::{PipelineConfig, DEFAULT_JPEG_QUALITY};

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_DEVICE_PATH: &str = "/dev/edge_detection";
const DEFAULT_DEVICE_TIMEOUT_MS: u64 = 500;
const DEFAULT_RETRY_PAUSE_MS: u64 = 100;
const DEFAULT_SNAPSHOT_DIR: &str = "./snapshots";

#[derive(Debug, Deserialize, Default)]
struct StreamerConfigFile {
    http: Option<HttpConfigFile>,
    camera: Option<CameraConfigFile>,
    transform_device: Option<DeviceConfigFile>,
    stream: Option<StreamConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    format: Option<String>,
    vflip: Option<bool>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    path: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    ioctl_command: Option<u32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    display_width: Option<u32>,
    display_height: Option<u32>,
    jpeg_quality: Option<u8>,
    retry_pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    dir: Option<PathBuf>,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub http_addr: String,
    pub camera: CameraConfig,
    pub device: DeviceConfig,
    pub pipeline: PipelineConfig,
    pub retry_pause: Duration,
    pub snapshot_dir: PathBuf,
}

impl StreamerConfig {
    /// Config file from `EDGE_STREAMER_CONFIG` (if set), then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = non_empty_env("EDGE_STREAMER_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file path.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.http_addr.clone(),
            retry_pause: self.retry_pause,
        }
    }

    fn from_file(file: StreamerConfigFile) -> Result<Self> {
        let http_addr = file
            .http
            .and_then(|http| http.addr)
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());

        let camera_defaults = CameraConfig::default();
        let camera_file = file.camera.unwrap_or_default();
        let format = match camera_file.format {
            Some(name) => name.parse::<RawPixelFormat>().map_err(|e| anyhow!(e))?,
            None => camera_defaults.format,
        };
        let camera = CameraConfig {
            device: camera_file.device.unwrap_or(camera_defaults.device),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            format,
            vflip: camera_file.vflip.unwrap_or(camera_defaults.vflip),
            target_fps: camera_file.target_fps.unwrap_or(camera_defaults.target_fps),
        };

        let device_file = file.transform_device.unwrap_or_default();
        let device = DeviceConfig {
            path: device_file
                .path
                .unwrap_or_else(|| DEFAULT_DEVICE_PATH.to_string()),
            width: device_file.width.unwrap_or(DEVICE_WIDTH),
            height: device_file.height.unwrap_or(DEVICE_HEIGHT),
            ioctl_command: device_file.ioctl_command.unwrap_or(IOCTL_SET_EDGE_DETECTION),
            timeout: Duration::from_millis(
                device_file.timeout_ms.unwrap_or(DEFAULT_DEVICE_TIMEOUT_MS),
            ),
        };

        let stream_file = file.stream.unwrap_or_default();
        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            display_width: stream_file
                .display_width
                .unwrap_or(pipeline_defaults.display_width),
            display_height: stream_file
                .display_height
                .unwrap_or(pipeline_defaults.display_height),
            jpeg_quality: stream_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };
        let retry_pause = Duration::from_millis(
            stream_file
                .retry_pause_ms
                .unwrap_or(DEFAULT_RETRY_PAUSE_MS),
        );

        let snapshot_dir = file
            .snapshot
            .and_then(|snapshot| snapshot.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR));

        Ok(Self {
            http_addr,
            camera,
            device,
            pipeline,
            retry_pause,
            snapshot_dir,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("EDGE_STREAMER_ADDR") {
            self.http_addr = addr;
        }
        if let Some(camera) = non_empty_env("EDGE_STREAMER_CAMERA") {
            self.camera.device = camera;
        }
        if let Some(device) = non_empty_env("EDGE_STREAMER_DEVICE") {
            self.device.path = device;
        }
        if let Some(dir) = non_empty_env("EDGE_STREAMER_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = non_empty_env("EDGE_STREAMER_DEVICE_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("EDGE_STREAMER_DEVICE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.device.timeout = Duration::from_millis(millis);
        }
        if let Some(pause) = non_empty_env("EDGE_STREAMER_RETRY_PAUSE_MS") {
            let millis: u64 = pause.parse().map_err(|_| {
                anyhow!("EDGE_STREAMER_RETRY_PAUSE_MS must be an integer number of milliseconds")
            })?;
            self.retry_pause = Duration::from_millis(millis);
        }
        if let Some(quality) = non_empty_env("EDGE_STREAMER_JPEG_QUALITY") {
            self.pipeline.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("EDGE_STREAMER_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera dimensions must be non-zero"));
        }
        if self.device.width == 0 || self.device.height == 0 {
            return Err(anyhow!("transform_device dimensions must be non-zero"));
        }
        if self.pipeline.display_width == 0 || self.pipeline.display_height == 0 {
            return Err(anyhow!("stream display dimensions must be non-zero"));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!(
                "jpeg_quality must be within 1..=100, got {}",
                self.pipeline.jpeg_quality
            ));
        }
        if self.device.timeout.is_zero() {
            return Err(anyhow!("transform_device timeout must be greater than zero"));
        }
        if self.http_addr.trim().is_empty() {
            return Err(anyhow!("http addr must not be empty"));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<StreamerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
