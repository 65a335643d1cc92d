use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use edge_streamer::device::{DeviceError, LoopbackDevice, TransformDevice};
use edge_streamer::ingest::{CameraConfig, FrameSource};
use edge_streamer::{
    ControlSurface, DeviceChannel, FramePipeline, PipelineConfig, PipelineMode, ServerConfig,
    ServerHandle, StreamServer,
};

const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Echoes like the loopback device but answers the listed round trips
/// (0-based) with a truncated buffer.
struct ScriptedDevice {
    calls: Arc<AtomicUsize>,
    short_on: Vec<usize>,
}

impl TransformDevice for ScriptedDevice {
    fn set_mode(&mut self, _enabled: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    fn round_trip(&mut self, input: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.short_on.contains(&call) {
            Ok(input[..input.len() / 2].to_vec())
        } else {
            Ok(input.to_vec())
        }
    }
}

struct RejectingDevice;

impl TransformDevice for RejectingDevice {
    fn set_mode(&mut self, _enabled: bool) -> Result<(), DeviceError> {
        Err(DeviceError::ControlRejected(std::io::Error::from_raw_os_error(25)))
    }

    fn round_trip(&mut self, _input: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::Timeout(Duration::from_millis(1)))
    }
}

struct TestServer {
    dir: tempfile::TempDir,
    pipeline: Arc<FramePipeline>,
    handle: Option<ServerHandle>,
}

impl TestServer {
    fn new(device: Box<dyn TransformDevice>) -> Result<Self> {
        let dir = tempdir()?;
        let camera = CameraConfig {
            width: 320,
            height: 240,
            target_fps: 30,
            ..CameraConfig::default()
        };
        let source = Arc::new(FrameSource::open(&camera)?);
        let channel = Arc::new(DeviceChannel::with_device(device, 640, 480));
        let pipeline = Arc::new(FramePipeline::new(
            source,
            channel.clone(),
            PipelineMode::new(),
            PipelineConfig::default(),
        ));
        let control = Arc::new(ControlSurface::new(
            pipeline.clone(),
            channel,
            dir.path().join("snapshots"),
        ));
        let server_config = ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            retry_pause: RETRY_PAUSE,
        };
        let handle = StreamServer::new(server_config, pipeline.clone(), control).spawn()?;
        Ok(Self {
            dir,
            pipeline,
            handle: Some(handle),
        })
    }

    fn loopback() -> Result<Self> {
        Self::new(Box::new(LoopbackDevice::new()))
    }

    fn handle(&self) -> &ServerHandle {
        self.handle
            .as_ref()
            .expect("test server handle should be initialized")
    }

    fn get(&self, path: &str) -> Result<(String, String)> {
        self.request("GET", path)
    }

    fn request(&self, method: &str, path: &str) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn message(&self, path: &str) -> Result<String> {
        let (headers, body) = self.get(path)?;
        assert!(headers.starts_with("HTTP/1.1 200 OK"), "{headers}");
        assert!(headers.contains("Content-Type: application/json"));
        let value: Value = serde_json::from_str(&body)?;
        value["message"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("missing message in {body}"))
    }

    fn open_stream(&self) -> Result<MjpegClient> {
        MjpegClient::connect(self.handle())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop stream server");
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

/// Reads `multipart/x-mixed-replace` parts off a live stream.
struct MjpegClient {
    reader: BufReader<TcpStream>,
    headers: String,
}

impl MjpegClient {
    fn connect(handle: &ServerHandle) -> Result<Self> {
        let mut stream = TcpStream::connect(handle.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(b"GET /api/stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        let mut reader = BufReader::new(stream);
        let headers = read_header_block(&mut reader)?;
        Ok(Self { reader, headers })
    }

    fn next_part(&mut self) -> Result<Vec<u8>> {
        let mut boundary = String::new();
        self.reader.read_line(&mut boundary)?;
        if boundary != "--frame\r\n" {
            return Err(anyhow!("unexpected boundary line {boundary:?}"));
        }
        let headers = read_header_block(&mut self.reader)?;
        if !headers.contains("Content-Type: image/jpeg") {
            return Err(anyhow!("part is not a jpeg: {headers}"));
        }
        let len: usize = headers
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .ok_or_else(|| anyhow!("part without length: {headers}"))?
            .trim()
            .parse()?;
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body)?;
        let mut trailer = [0u8; 2];
        self.reader.read_exact(&mut trailer)?;
        if &trailer != b"\r\n" {
            return Err(anyhow!("part not terminated by CRLF"));
        }
        Ok(body)
    }
}

fn read_header_block(reader: &mut impl BufRead) -> Result<String> {
    let mut block = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(anyhow!("connection closed inside header block"));
        }
        if line == "\r\n" {
            return Ok(block);
        }
        block.push_str(&line);
    }
}

#[test]
fn stream_serves_multipart_jpeg_parts() -> Result<()> {
    let server = TestServer::loopback()?;
    let mut client = server.open_stream()?;
    assert!(client.headers.starts_with("HTTP/1.1 200 OK"));
    assert!(client
        .headers
        .contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));

    for _ in 0..3 {
        let part = client.next_part()?;
        let decoded = image::load_from_memory(&part)?;
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
    }
    Ok(())
}

#[test]
fn closing_one_stream_leaves_others_running() -> Result<()> {
    let server = TestServer::loopback()?;
    let mut first = server.open_stream()?;
    let mut second = server.open_stream()?;

    first.next_part()?;
    second.next_part()?;
    drop(first);

    for _ in 0..5 {
        second.next_part()?;
    }
    Ok(())
}

#[test]
fn short_read_skips_a_tick_and_stream_recovers() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = TestServer::new(Box::new(ScriptedDevice {
        calls: calls.clone(),
        short_on: vec![0],
    }))?;
    assert_eq!(server.message("/api/enable_edge_detection")?, "Edge detection enabled");

    let started = Instant::now();
    let mut client = server.open_stream()?;
    let part = client.next_part()?;
    assert!(started.elapsed() >= RETRY_PAUSE);

    let decoded = image::load_from_memory(&part)?.into_luma8();
    assert_eq!(decoded.dimensions(), (640, 480));
    assert!(calls.load(Ordering::SeqCst) >= 2);

    client.next_part()?;
    let stats = server.pipeline.stats();
    assert_eq!(stats.transform_failures, 1);
    assert!(stats.transformed_frames >= 2);
    Ok(())
}

#[test]
fn stream_ends_when_client_leaves_during_failures() -> Result<()> {
    let server = TestServer::new(Box::new(RejectingDevice))?;
    server.pipeline.mode().set(true);

    let client = server.open_stream()?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.pipeline.stats().transform_failures < 2 {
        assert!(Instant::now() < deadline, "no failing ticks observed");
        std::thread::sleep(RETRY_PAUSE / 2);
    }
    drop(client);

    // One more tick may already be under way when the client goes.
    std::thread::sleep(RETRY_PAUSE * 4);
    let settled = server.pipeline.stats().transform_failures;
    std::thread::sleep(RETRY_PAUSE * 6);
    assert_eq!(server.pipeline.stats().transform_failures, settled);
    Ok(())
}

#[test]
fn control_endpoints_toggle_mode() -> Result<()> {
    let server = TestServer::loopback()?;
    let mode = server.pipeline.mode().clone();

    assert_eq!(server.message("/api/enable_edge_detection")?, "Edge detection enabled");
    assert!(mode.is_enabled());
    assert_eq!(server.message("/api/enable_edge_detection")?, "Edge detection enabled");
    assert!(mode.is_enabled());

    assert_eq!(
        server.message("/api/disable_edge_detection")?,
        "Edge detection disabled"
    );
    assert!(!mode.is_enabled());
    Ok(())
}

#[test]
fn rejected_enable_reports_failure_message() -> Result<()> {
    let server = TestServer::new(Box::new(RejectingDevice))?;
    let message = server.message("/api/enable_edge_detection")?;
    assert!(
        message.starts_with("Failed to enable edge detection: "),
        "{message}"
    );
    assert!(!server.pipeline.mode().is_enabled());
    Ok(())
}

#[test]
fn snapshot_endpoint_writes_jpeg() -> Result<()> {
    let server = TestServer::loopback()?;
    let message = server.message("/api/snapshot")?;
    let path = message
        .strip_prefix("Snapshot saved as ")
        .ok_or_else(|| anyhow!("unexpected message {message}"))?;

    let path = std::path::Path::new(path);
    assert!(path.starts_with(server.dir.path().join("snapshots")));
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("snapshot path without file name"))?;
    assert!(name.starts_with("snapshot_") && name.ends_with(".jpg"));
    assert_eq!(name.len(), "snapshot_20240101_000000.jpg".len());

    let bytes = std::fs::read(path)?;
    let decoded = image::load_from_memory(&bytes)?;
    assert_eq!((decoded.width(), decoded.height()), (640, 480));
    Ok(())
}

#[test]
fn failed_snapshot_reports_failure_message() -> Result<()> {
    let server = TestServer::new(Box::new(RejectingDevice))?;
    server.pipeline.mode().set(true);
    assert_eq!(server.message("/api/snapshot")?, "Failed to capture snapshot");
    assert!(!server.dir.path().join("snapshots").exists());
    Ok(())
}

#[test]
fn viewer_health_and_unknown_routes() -> Result<()> {
    let server = TestServer::loopback()?;

    let (headers, body) = server.get("/")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert!(headers.contains("text/html"));
    assert!(body.contains("/api/stream"));

    let (headers, body) = server.get("/health")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["status"], "ok");

    let (headers, _body) = server.get("/api/unknown")?;
    assert!(headers.starts_with("HTTP/1.1 404 Not Found"));

    let (headers, _body) = server.request("POST", "/api/snapshot")?;
    assert!(headers.starts_with("HTTP/1.1 405 Method Not Allowed"));
    Ok(())
}
