//! Mode toggles and snapshots.
//!
//! A toggle performs the device control call first and flips `PipelineMode`
//! only after the device accepted it, so a failed call leaves the stream in
//! its last good mode. Repeated toggles always reach the device.

use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::device::{DeviceChannel, DeviceError};
use crate::pipeline::{FramePipeline, PipelineError, PipelineMode};

/// JSON body returned by every control endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub message: String,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("no frame available: {0}")]
    Snapshot(#[source] PipelineError),

    #[error("failed to write snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct ControlSurface {
    pipeline: Arc<FramePipeline>,
    device: Arc<DeviceChannel>,
    mode: PipelineMode,
    snapshot_dir: PathBuf,
}

impl ControlSurface {
    pub fn new(
        pipeline: Arc<FramePipeline>,
        device: Arc<DeviceChannel>,
        snapshot_dir: impl Into<PathBuf>,
    ) -> Self {
        let mode = pipeline.mode().clone();
        Self {
            pipeline,
            device,
            mode,
            snapshot_dir: snapshot_dir.into(),
        }
    }

    pub fn mode(&self) -> &PipelineMode {
        &self.mode
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn enable_transform(&self) -> Result<StatusMessage, OperationError> {
        self.device.set_mode(true)?;
        self.mode.set(true);
        log::info!("edge detection enabled");
        Ok(StatusMessage::new("Edge detection enabled"))
    }

    pub fn disable_transform(&self) -> Result<StatusMessage, OperationError> {
        self.device.set_mode(false)?;
        self.mode.set(false);
        log::info!("edge detection disabled");
        Ok(StatusMessage::new("Edge detection disabled"))
    }

    /// Pull one frame through the pipeline and write it to the snapshot
    /// directory. Nothing is written when the pipeline fails.
    pub fn snapshot(&self) -> Result<StatusMessage, OperationError> {
        let image = self.pipeline.next().map_err(OperationError::Snapshot)?;

        std::fs::create_dir_all(&self.snapshot_dir).map_err(|source| OperationError::Io {
            path: self.snapshot_dir.clone(),
            source,
        })?;
        let path = self.snapshot_dir.join(snapshot_file_name(Local::now()));
        std::fs::write(&path, image.as_bytes()).map_err(|source| OperationError::Io {
            path: path.clone(),
            source,
        })?;

        log::info!("snapshot saved as {} ({} bytes)", path.display(), image.len());
        Ok(StatusMessage::new(format!(
            "Snapshot saved as {}",
            path.display()
        )))
    }
}

/// `snapshot_<YYYYMMDD_HHMMSS>.jpg`
pub fn snapshot_file_name<Tz>(at: chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("snapshot_{}.jpg", at.format("%Y%m%d_%H%M%S"))
}
