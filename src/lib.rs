//! Edge Streamer
//!
//! Streams a camera as MJPEG over HTTP, optionally routing every frame
//! through a hardware edge-detection accelerator exposed as a character
//! device.
//!
//! # Data flow
//!
//! ```text
//! FrameSource ──► FramePipeline ──► StreamServer ──► viewers
//!                     │  ▲
//!      PipelineMode ──┘  └── DeviceChannel (when enabled)
//!            ▲
//!      ControlSurface (enable / disable / snapshot)
//! ```
//!
//! # Module Structure
//!
//! - `frame`: Owned pixel buffers and encoded stills
//! - `ingest`: Camera backends (synthetic, V4L2) behind `FrameSource`
//! - `device`: Transform device protocol (char device, loopback)
//! - `pipeline`: Capture, transform, resize, encode
//! - `control`: Mode toggles and snapshots
//! - `api`: HTTP server, MJPEG stream and control endpoints
//! - `config`: JSON file plus environment configuration

pub mod api;
pub mod config;
pub mod control;
pub mod device;
pub mod frame;
pub mod ingest;
pub mod pipeline;

pub use api::{ServerConfig, ServerHandle, StreamServer, STREAM_BOUNDARY};
pub use config::StreamerConfig;
pub use control::{ControlSurface, OperationError, StatusMessage};
pub use device::{DeviceChannel, DeviceConfig, DeviceError, TransformDevice};
pub use frame::{EncodedImage, Frame, FrameError, PixelLayout};
pub use ingest::{CameraConfig, CaptureError, FatalStartupError, FrameSource, RawPixelFormat};
pub use pipeline::{FramePipeline, PipelineConfig, PipelineError, PipelineMode, PipelineStats};
