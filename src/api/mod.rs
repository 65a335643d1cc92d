//! HTTP surface: viewer page, MJPEG stream, control endpoints.
//!
//! One accept thread; every accepted connection gets its own thread. A
//! stream connection then runs its own pull loop over `FramePipeline::next()`,
//! so a slow viewer only ever delays itself. Control endpoints always answer
//! 200 with `{"message": ...}`; the text tells success from failure.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::control::{ControlSurface, StatusMessage};
use crate::frame::EncodedImage;
use crate::pipeline::FramePipeline;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Multipart boundary token for `/api/stream`.
pub const STREAM_BOUNDARY: &str = "frame";

const VIEWER_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
    <body>
        <img src="/api/stream" width="100%">
        <button onclick="fetch('/api/enable_edge_detection').then(r => r.json()).then(d => alert(d.message))">Enable Edge Detection</button>
        <button onclick="fetch('/api/disable_edge_detection').then(r => r.json()).then(d => alert(d.message))">Disable Edge Detection</button>
        <button onclick="fetch('/api/snapshot').then(r => r.json()).then(d => alert(d.message))">Take Snapshot</button>
    </body>
</html>
"#;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    /// Pause after a tick that produced no frame.
    pub retry_pause: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            retry_pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, end every open stream after its current tick, and wait
    /// for all connection threads.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

struct ServerContext {
    pipeline: Arc<FramePipeline>,
    control: Arc<ControlSurface>,
    retry_pause: Duration,
    shutdown: Arc<AtomicBool>,
}

pub struct StreamServer {
    cfg: ServerConfig,
    pipeline: Arc<FramePipeline>,
    control: Arc<ControlSurface>,
}

impl StreamServer {
    pub fn new(
        cfg: ServerConfig,
        pipeline: Arc<FramePipeline>,
        control: Arc<ControlSurface>,
    ) -> Self {
        Self {
            cfg,
            pipeline,
            control,
        }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(ServerContext {
            pipeline: self.pipeline,
            control: self.control,
            retry_pause: self.cfg.retry_pause,
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("stream-accept".to_string())
            .spawn(move || run_server(listener, ctx))?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

/// Where the accept loop takes connections from. The listener must be
/// non-blocking so the loop can watch the shutdown flag.
trait Acceptor: Send + 'static {
    fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

fn run_server(listener: impl Acceptor, ctx: Arc<ServerContext>) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !ctx.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("conn-{peer}"))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("request from {} failed: {}", peer, err);
                        }
                    });
                match spawned {
                    Ok(join) => connections.push(join),
                    Err(err) => log::error!("failed to spawn connection thread: {}", err),
                }
                connections.retain(|join| !join.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            // Aborted handshakes and fd exhaustion pass; keep serving.
            Err(err) => {
                log::warn!("accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    for join in connections {
        let _ = join.join();
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &ServerContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let peer = stream.peer_addr()?;

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    log::debug!("GET {} from {}", request.path, peer);

    match request.path.as_str() {
        "/" => write_response(&mut stream, 200, "text/html; charset=utf-8", VIEWER_PAGE.as_bytes()),
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/api/stream" => {
            log::info!("stream opened by {}", peer);
            let delivered = stream_frames(&mut stream, ctx)?;
            log::info!("stream to {} closed after {} frames", peer, delivered);
            Ok(())
        }
        "/api/enable_edge_detection" => {
            let status = ctx.control.enable_transform().unwrap_or_else(|err| {
                log::warn!("enable edge detection failed: {}", err);
                StatusMessage::new(format!("Failed to enable edge detection: {err}"))
            });
            write_status(&mut stream, &status)
        }
        "/api/disable_edge_detection" => {
            let status = ctx.control.disable_transform().unwrap_or_else(|err| {
                log::warn!("disable edge detection failed: {}", err);
                StatusMessage::new(format!("Failed to disable edge detection: {err}"))
            });
            write_status(&mut stream, &status)
        }
        "/api/snapshot" => {
            let status = ctx.control.snapshot().unwrap_or_else(|err| {
                log::warn!("snapshot failed: {}", err);
                StatusMessage::new("Failed to capture snapshot")
            });
            write_status(&mut stream, &status)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Serve multipart parts until the client goes away or the server stops.
/// Ticks without a frame are logged and retried after `retry_pause`; they
/// never end the stream.
fn stream_frames(stream: &mut TcpStream, ctx: &ServerContext) -> Result<u64> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;

    let mut delivered = 0u64;
    while !ctx.shutdown.load(Ordering::SeqCst) {
        match ctx.pipeline.next() {
            Ok(image) => {
                if let Err(err) = write_part(stream, &image) {
                    log::debug!("stream write failed: {}", err);
                    break;
                }
                delivered += 1;
            }
            Err(err) => {
                if peer_closed(stream) {
                    log::debug!("client left while frames were failing");
                    break;
                }
                log::warn!("no frame this tick: {}", err);
                std::thread::sleep(ctx.retry_pause);
            }
        }
    }
    Ok(delivered)
}

/// True once the viewer has hung up. A viewer sends nothing after its
/// request, so EOF or a socket error on a non-blocking peek means it is gone.
fn peer_closed(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut byte = [0u8; 1];
    let closed = match stream.peek(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() != std::io::ErrorKind::WouldBlock,
    };
    closed || stream.set_nonblocking(false).is_err()
}

/// Write one multipart part carrying a JPEG.
pub fn write_part(out: &mut impl Write, image: &EncodedImage) -> std::io::Result<()> {
    let head = format!(
        "--{STREAM_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        image.len()
    );
    out.write_all(head.as_bytes())?;
    out.write_all(image.as_bytes())?;
    out.write_all(b"\r\n")?;
    out.flush()
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_status(stream: &mut TcpStream, status: &StatusMessage) -> Result<()> {
    let body = serde_json::to_vec(status)?;
    write_response(stream, 200, "application/json", &body)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
