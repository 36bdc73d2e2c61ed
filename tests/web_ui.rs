use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use tomato_vision::detect::{ColorBackend, YoloModel};
use tomato_vision::display::decode_jpeg;
use tomato_vision::frame::{ChannelOrder, Frame, DISPLAY_HEIGHT, DISPLAY_WIDTH};
use tomato_vision::ingest::{CaptureBackend, CaptureTarget, DefaultCaptureBackend, VideoCapture};
use tomato_vision::resolve::YtDlpResolver;
use tomato_vision::web::{AppState, WebConfig, WebHandle, WebServer};

fn spawn_server(upload_limit: u64) -> WebHandle {
    spawn_server_with(Arc::new(DefaultCaptureBackend::new()), upload_limit)
}

fn spawn_server_with(capture: Arc<dyn CaptureBackend>, upload_limit: u64) -> WebHandle {
    let model = YoloModel::new(Box::new(ColorBackend::new()), vec!["tomato".to_string()]);
    let state = Arc::new(AppState::new(
        capture,
        Arc::new(YtDlpResolver::default()),
        Box::new(model),
    ));
    let cfg = WebConfig {
        addr: "127.0.0.1:0".to_string(),
        upload_limit,
        ..WebConfig::default()
    };
    WebServer::new(cfg, state).spawn().expect("spawn web ui")
}

struct Response {
    status: u16,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

fn request(addr: SocketAddr, method: &str, path: &str, body: &[u8]) -> Response {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("timeout");
    let head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n",
        method,
        path,
        addr,
        body.len()
    );
    stream.write_all(head.as_bytes()).expect("write head");
    stream.write_all(body).expect("write body");
    read_response(stream)
}

fn read_response(mut stream: TcpStream) -> Response {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    Response {
        status,
        body: raw[split + 4..].to_vec(),
    }
}

fn wait_until_idle(addr: SocketAddr) -> Value {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let status = request(addr, "GET", "/status", b"").json();
        if status["running"] == Value::Bool(false) {
            return status;
        }
        assert!(Instant::now() < deadline, "session did not finish: {}", status);
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn serves_page_health_and_empty_slot() {
    let handle = spawn_server(1024 * 1024);
    let addr = handle.addr;

    let page = request(addr, "GET", "/", b"");
    assert_eq!(page.status, 200);
    let html = String::from_utf8_lossy(&page.body);
    assert!(html.contains("Detect Tomatoes"));
    assert!(html.contains("bytetrack.yaml"));

    let health = request(addr, "GET", "/health", b"");
    assert_eq!(health.status, 200);
    assert_eq!(health.json()["status"], "ok");

    assert_eq!(request(addr, "GET", "/frame.jpg", b"").status, 404);
    assert_eq!(request(addr, "GET", "/nope", b"").status, 404);
    assert_eq!(request(addr, "DELETE", "/status", b"").status, 405);

    handle.stop().expect("stop");
}

#[test]
fn stream_session_fills_the_display_slot() {
    let handle = spawn_server(1024 * 1024);
    let addr = handle.addr;

    let started = request(
        addr,
        "POST",
        "/detect?source=rtsp&url=stub%3A%2F%2Fcam%3Fframes%3D5&tracker=bytetrack.yaml&conf=40",
        b"",
    );
    assert_eq!(started.status, 202);
    assert_eq!(started.json()["source"], "rtsp");

    let status = wait_until_idle(addr);
    assert_eq!(status["frames"], 5);
    assert_eq!(status["caption"], "Detected Video");
    assert_eq!(status["notices"].as_array().map(Vec::len), Some(0));

    let frame = request(addr, "GET", "/frame.jpg", b"");
    assert_eq!(frame.status, 200);
    let decoded = decode_jpeg(&frame.body).expect("jpeg");
    assert_eq!(decoded.dimensions(), (DISPLAY_WIDTH, DISPLAY_HEIGHT));

    handle.stop().expect("stop");
}

#[test]
fn failed_sessions_surface_one_error_notice() {
    let handle = spawn_server(1024 * 1024);
    let addr = handle.addr;

    let started = request(addr, "POST", "/detect?source=rtsp&url=stub%3A%2F%2Fcam%3Fclosed%3D1", b"");
    assert_eq!(started.status, 202);
    let status = wait_until_idle(addr);
    let notices = status["notices"].as_array().cloned().unwrap_or_default();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0]["level"], "error");
    assert_eq!(status["frames"], 0);

    handle.stop().expect("stop");
}

#[test]
fn stop_cancels_a_running_session() {
    let handle = spawn_server(1024 * 1024);
    let addr = handle.addr;

    let started = request(addr, "POST", "/detect?source=rtsp&url=stub%3A%2F%2Fendless", b"");
    assert_eq!(started.status, 202);
    let stopped = request(addr, "POST", "/stop", b"");
    assert_eq!(stopped.status, 200);
    assert_eq!(stopped.json()["was_running"], true);

    let status = request(addr, "GET", "/status", b"").json();
    assert_eq!(status["running"], false);

    handle.stop().expect("stop");
}

const STALL: Duration = Duration::from_millis(1500);

/// A stream whose every read blocks for `STALL`, like a source that stopped
/// sending data.
struct StallingBackend;

struct StallingCapture {
    open: bool,
}

impl CaptureBackend for StallingBackend {
    fn open(&self, _target: &CaptureTarget) -> anyhow::Result<Box<dyn VideoCapture>> {
        Ok(Box::new(StallingCapture { open: true }))
    }
}

impl VideoCapture for StallingCapture {
    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        std::thread::sleep(STALL);
        Ok(Some(Frame::filled(64, 48, ChannelOrder::Bgr, [40, 140, 60])))
    }

    fn release(&mut self) {
        self.open = false;
    }
}

#[test]
fn stalled_reads_do_not_block_other_requests() {
    let handle = spawn_server_with(Arc::new(StallingBackend), 1024 * 1024);
    let addr = handle.addr;

    assert_eq!(request(addr, "POST", "/detect?source=webcam", b"").status, 202);
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let stopped = request(addr, "POST", "/stop", b"");
    assert_eq!(stopped.json()["was_running"], true);
    assert_eq!(request(addr, "GET", "/health", b"").status, 200);
    assert_eq!(request(addr, "GET", "/status", b"").json()["running"], false);

    assert_eq!(request(addr, "POST", "/detect?source=webcam", b"").status, 202);
    assert_eq!(request(addr, "GET", "/status", b"").json()["running"], true);
    assert!(
        started.elapsed() < STALL / 2,
        "requests waited {:?} on a stalled read",
        started.elapsed()
    );

    handle.stop().expect("stop");
}

#[test]
fn still_images_are_detected_inline() {
    let handle = spawn_server(1024 * 1024);
    let addr = handle.addr;

    let mut image = image::RgbImage::from_pixel(96, 96, image::Rgb([40, 140, 60]));
    for y in 32..64 {
        for x in 32..64 {
            image.put_pixel(x, y, image::Rgb([220, 30, 30]));
        }
    }
    let mut png = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .expect("encode png");

    let response = request(addr, "POST", "/detect?source=image&conf=25", &png);
    assert_eq!(response.status, 200);
    let body = response.json();
    assert_eq!(body["status"], "done");
    let detections = body["detections"].as_array().cloned().unwrap_or_default();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["class"], "tomato");

    let status = request(addr, "GET", "/status", b"").json();
    assert_eq!(status["caption"], "Detected Image");

    handle.stop().expect("stop");
}

#[test]
fn rejects_bad_requests() {
    let handle = spawn_server(1024);
    let addr = handle.addr;

    assert_eq!(request(addr, "POST", "/detect", b"").status, 400);
    assert_eq!(request(addr, "POST", "/detect?source=webcam&conf=5", b"").status, 400);
    assert_eq!(request(addr, "POST", "/detect?source=fax", b"").status, 400);
    assert_eq!(
        request(addr, "POST", "/detect?source=stored&name=missing", b"").status,
        400
    );

    let upload = request(addr, "POST", "/detect?source=video&name=notes.txt", b"hello");
    assert_eq!(upload.status, 400);
    assert_eq!(upload.json()["error"], "upload");

    // Header announces more than the limit; the server answers before any body arrives.
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .write_all(b"POST /detect?source=video&name=a.mp4 HTTP/1.1\r\nContent-Length: 4096\r\n\r\n")
        .expect("write head");
    assert_eq!(read_response(stream).status, 413);

    handle.stop().expect("stop");
}
