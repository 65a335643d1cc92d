use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use edge_streamer::config::StreamerConfig;
use edge_streamer::RawPixelFormat;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "EDGE_STREAMER_CONFIG",
        "EDGE_STREAMER_ADDR",
        "EDGE_STREAMER_CAMERA",
        "EDGE_STREAMER_DEVICE",
        "EDGE_STREAMER_SNAPSHOT_DIR",
        "EDGE_STREAMER_DEVICE_TIMEOUT_MS",
        "EDGE_STREAMER_RETRY_PAUSE_MS",
        "EDGE_STREAMER_JPEG_QUALITY",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamerConfig::load().expect("load config");
    assert_eq!(cfg.http_addr, "0.0.0.0:5000");
    assert_eq!(cfg.camera.device, "stub://camera");
    assert_eq!((cfg.camera.width, cfg.camera.height), (1920, 1080));
    assert_eq!(cfg.camera.format, RawPixelFormat::Xbgr8888);
    assert!(cfg.camera.vflip);
    assert_eq!(cfg.camera.target_fps, 30);
    assert_eq!(cfg.device.path, "/dev/edge_detection");
    assert_eq!((cfg.device.width, cfg.device.height), (640, 480));
    assert_eq!(cfg.device.ioctl_command, 0x4004_6501);
    assert_eq!(cfg.device.timeout, Duration::from_millis(500));
    assert_eq!(
        (cfg.pipeline.display_width, cfg.pipeline.display_height),
        (640, 480)
    );
    assert_eq!(cfg.pipeline.jpeg_quality, 80);
    assert_eq!(cfg.retry_pause, Duration::from_millis(100));
    assert_eq!(cfg.snapshot_dir, std::path::PathBuf::from("./snapshots"));
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "http": { "addr": "127.0.0.1:8080" },
            "camera": {
                "device": "/dev/video2",
                "width": 1280,
                "height": 720,
                "format": "nv12",
                "vflip": false,
                "target_fps": 15
            },
            "transform_device": {
                "path": "/dev/edge0",
                "timeout_ms": 250
            },
            "stream": {
                "display_width": 800,
                "display_height": 600,
                "jpeg_quality": 60,
                "retry_pause_ms": 40
            },
            "snapshot": { "dir": "/var/lib/edge/snapshots" }
        }"#,
    );

    std::env::set_var("EDGE_STREAMER_CONFIG", file.path());
    std::env::set_var("EDGE_STREAMER_ADDR", "0.0.0.0:9000");
    std::env::set_var("EDGE_STREAMER_DEVICE_TIMEOUT_MS", "750");
    std::env::set_var("EDGE_STREAMER_JPEG_QUALITY", "90");

    let cfg = StreamerConfig::load().expect("load config");
    assert_eq!(cfg.http_addr, "0.0.0.0:9000");
    assert_eq!(cfg.camera.device, "/dev/video2");
    assert_eq!((cfg.camera.width, cfg.camera.height), (1280, 720));
    assert_eq!(cfg.camera.format, RawPixelFormat::Nv12);
    assert!(!cfg.camera.vflip);
    assert_eq!(cfg.camera.target_fps, 15);
    assert_eq!(cfg.device.path, "/dev/edge0");
    assert_eq!((cfg.device.width, cfg.device.height), (640, 480));
    assert_eq!(cfg.device.timeout, Duration::from_millis(750));
    assert_eq!(
        (cfg.pipeline.display_width, cfg.pipeline.display_height),
        (800, 600)
    );
    assert_eq!(cfg.pipeline.jpeg_quality, 90);
    assert_eq!(cfg.retry_pause, Duration::from_millis(40));
    assert_eq!(
        cfg.snapshot_dir,
        std::path::PathBuf::from("/var/lib/edge/snapshots")
    );

    let server = cfg.server_config();
    assert_eq!(server.addr, "0.0.0.0:9000");
    assert_eq!(server.retry_pause, Duration::from_millis(40));

    clear_env();
}

#[test]
fn rejects_out_of_range_jpeg_quality() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("EDGE_STREAMER_JPEG_QUALITY", "0");
    assert!(StreamerConfig::load().is_err());

    std::env::set_var("EDGE_STREAMER_JPEG_QUALITY", "101");
    assert!(StreamerConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_zero_timeout_and_bad_numbers() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("EDGE_STREAMER_DEVICE_TIMEOUT_MS", "0");
    assert!(StreamerConfig::load().is_err());

    std::env::set_var("EDGE_STREAMER_DEVICE_TIMEOUT_MS", "soon");
    assert!(StreamerConfig::load().is_err());

    clear_env();
    std::env::set_var("EDGE_STREAMER_RETRY_PAUSE_MS", "-5");
    assert!(StreamerConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_zero_dimensions_and_unknown_format() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let zero = write_config(r#"{ "camera": { "width": 0 } }"#);
    assert!(StreamerConfig::load_from(Some(zero.path())).is_err());

    let zero_device = write_config(r#"{ "transform_device": { "height": 0 } }"#);
    assert!(StreamerConfig::load_from(Some(zero_device.path())).is_err());

    let unknown = write_config(r#"{ "camera": { "format": "yuyv" } }"#);
    let err = StreamerConfig::load_from(Some(unknown.path())).unwrap_err();
    assert!(err.to_string().contains("unknown pixel format"));
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("EDGE_STREAMER_CONFIG", "/nonexistent/edge-streamer.json");
    assert!(StreamerConfig::load().is_err());

    clear_env();
}
