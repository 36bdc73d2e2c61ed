//! Browser UI server.
//!
//! A small blocking HTTP/1.1 server on one listener thread. Requests are
//! handled inline; pipeline sessions run on their own thread so the page can
//! keep polling `/status` and `/frame.jpg` while frames are processed.
//!
//! Only one session runs at a time. Starting or stopping a session cancels the
//! previous one without blocking the listener; the next session's thread waits
//! for it to release its capture handle before opening its own.

mod page;

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::config::AppConfig;
use crate::detect::{DetectionResult, Model, TrackerPreset};
use crate::display::{DisplaySink, DisplaySlot, Notice};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::CaptureBackend;
use crate::pipeline::{self, CancelToken, InferenceMode, Outcome, PipelineConfig};
use crate::resolve::UrlResolver;
use crate::source::{UploadedVideo, VideoSource};

const MAX_HEADER_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct WebConfig {
    pub addr: String,
    /// Largest accepted request body (uploads).
    pub upload_limit: u64,
    /// Confidence used when a request does not send one.
    pub default_confidence: f32,
    pub webcam_index: u32,
    pub default_image: PathBuf,
    pub videos: BTreeMap<String, PathBuf>,
}

impl WebConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            addr: cfg.web_addr.clone(),
            upload_limit: cfg.upload_limit,
            default_confidence: cfg.confidence,
            webcam_index: cfg.webcam_index,
            default_image: cfg.default_image.clone(),
            videos: cfg.videos.clone(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Shared state and sessions
// ----------------------------------------------------------------------------

/// How long still-image detection waits for a stopping session to release the
/// detector before reporting it busy.
const MODEL_WAIT: Duration = Duration::from_secs(2);

struct Session {
    id: u64,
    cancel: CancelToken,
    join: JoinHandle<()>,
}

/// Collaborators shared by every request and session.
pub struct AppState {
    capture: Arc<dyn CaptureBackend>,
    resolver: Arc<dyn UrlResolver>,
    model: Arc<Mutex<Box<dyn Model>>>,
    slot: DisplaySlot,
    session: Mutex<Option<Session>>,
    /// Cancelled sessions whose threads have not been joined yet.
    retired: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    pub fn new(
        capture: Arc<dyn CaptureBackend>,
        resolver: Arc<dyn UrlResolver>,
        model: Box<dyn Model>,
    ) -> Self {
        Self {
            capture,
            resolver,
            model: Arc::new(Mutex::new(model)),
            slot: DisplaySlot::new(),
            session: Mutex::new(None),
            retired: Arc::default(),
        }
    }

    pub fn slot(&self) -> &DisplaySlot {
        &self.slot
    }

    fn session_guard(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel `session` without waiting for its thread. A read blocked in the
    /// capture backend keeps the thread alive until it returns.
    fn retire(&self, session: Session) {
        session.cancel.cancel();
        self.slot.end_session(session.id);
        self.retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(session.join);
    }

    /// Cancel the running session, if any. Returns at once.
    pub fn stop_session(&self) -> bool {
        let previous = self.session_guard().take();
        match previous {
            Some(session) => {
                log::info!("cancelling session {}", session.id);
                self.retire(session);
                true
            }
            None => false,
        }
    }

    /// Cancel any session and wait for every session thread to finish.
    pub fn shutdown(&self) {
        self.stop_session();
        join_retired(&self.retired);
    }

    /// Replace the running session with a new pipeline invocation over `source`.
    ///
    /// The new session thread joins cancelled sessions before it opens its
    /// source, so at most one capture handle is open at a time. `upload` is kept
    /// alive until the session ends.
    pub fn start_session(
        &self,
        config: PipelineConfig,
        source: VideoSource,
        upload: Option<UploadedVideo>,
    ) {
        let mut guard = self.session_guard();
        if let Some(previous) = guard.take() {
            log::info!("stopping session {} before starting {}", previous.id, source);
            self.retire(previous);
        }

        let cancel = CancelToken::new();
        let capture = Arc::clone(&self.capture);
        let resolver = Arc::clone(&self.resolver);
        let model = Arc::clone(&self.model);
        let retired = Arc::clone(&self.retired);
        let slot = self.slot.clone();
        let thread_cancel = cancel.clone();

        let id = slot.begin_session();
        let join = std::thread::spawn(move || {
            let _upload = upload;
            join_retired(&retired);
            let report = {
                let mut model = model.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                pipeline::run_source(
                    &config,
                    &source,
                    capture.as_ref(),
                    resolver.as_ref(),
                    model.as_mut(),
                    &slot,
                    &thread_cancel,
                )
            };
            match &report.outcome {
                Outcome::Failed(err) => log::warn!("session {} failed: {}", source, err),
                outcome => log::info!(
                    "session {} ended: {:?} after {} frames",
                    source,
                    outcome,
                    report.frames
                ),
            }
            slot.end_session(id);
        });

        *guard = Some(Session { id, cancel, join });
    }

    /// Stop any session and run single-image detection inline.
    pub fn detect_still(
        &self,
        image: StillImage,
        confidence: f32,
    ) -> Result<DetectionResult, PipelineError> {
        self.stop_session();
        let Some(mut model) = self.lock_model_within(MODEL_WAIT) else {
            let err = PipelineError::Busy("the previous session is still stopping".to_string());
            self.slot.notify(Notice::error(err.to_string()));
            return Err(err);
        };
        let id = self.slot.begin_session();
        let result = match image {
            StillImage::Path(path) => {
                pipeline::detect_image(&path, confidence, model.as_mut(), &self.slot)
            }
            StillImage::Bytes(bytes) => match Frame::decode(&bytes) {
                Ok(frame) => pipeline::detect_frame(&frame, confidence, model.as_mut(), &self.slot),
                Err(err) => {
                    let err = PipelineError::decode(&err);
                    self.slot.notify(Notice::error(err.to_string()));
                    Err(err)
                }
            },
        };
        self.slot.end_session(id);
        result
    }

    fn lock_model_within(&self, wait: Duration) -> Option<MutexGuard<'_, Box<dyn Model>>> {
        let deadline = Instant::now() + wait;
        loop {
            match self.model.try_lock() {
                Ok(model) => return Some(model),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => return None,
                Err(TryLockError::WouldBlock) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }
}

fn join_retired(retired: &Mutex<Vec<JoinHandle<()>>>) {
    let handles = {
        let mut retired = retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *retired)
    };
    for join in handles {
        if join.join().is_err() {
            log::error!("pipeline session thread panicked");
        }
    }
}

pub enum StillImage {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct WebHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WebHandle {
    /// Stop accepting requests, then join the server thread and every session thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("web server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct WebServer {
    cfg: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(cfg: WebConfig, state: Arc<AppState>) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<WebHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid web address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "web ui configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_web(listener, &cfg, &state, &shutdown_thread) {
                log::error!("web ui stopped: {}", err);
            }
            state.shutdown();
        });

        log::info!("web ui listening on http://{}", addr);
        Ok(WebHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_web(
    listener: TcpListener,
    cfg: &WebConfig,
    state: &AppState,
    shutdown: &AtomicBool,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, cfg, state) {
                    log::warn!("web ui request rejected: {:#}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &WebConfig, state: &AppState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream, cfg.upload_limit) {
        Ok(request) => request,
        Err(RequestError::TooLarge(len)) => {
            write_json_response(&mut stream, 413, r#"{"error":"payload_too_large"}"#)?;
            return Err(anyhow!("request body of {} bytes exceeds the upload limit", len));
        }
        Err(RequestError::Malformed(err)) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    let HttpRequest {
        method,
        path,
        query,
        body,
    } = request;
    match (method.as_str(), path.as_str()) {
        ("GET", "/") => write_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            page::INDEX_HTML.as_bytes(),
        ),
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/frame.jpg") => match state.slot().latest_jpeg() {
            Some((jpeg, _seq)) => write_response(&mut stream, 200, "image/jpeg", &jpeg),
            None => write_json_response(&mut stream, 404, r#"{"error":"no_frame"}"#),
        },
        ("GET", "/status") => {
            let payload = serde_json::to_vec(&state.slot().snapshot())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        ("POST", "/detect") => handle_detect(&mut stream, &query, body, cfg, state),
        ("POST", "/stop") => {
            let stopped = state.stop_session();
            let body = serde_json::json!({ "status": "stopped", "was_running": stopped });
            write_response(&mut stream, 200, "application/json", body.to_string().as_bytes())
        }
        (_, "/" | "/health" | "/frame.jpg" | "/status" | "/detect" | "/stop") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

// ----------------------------------------------------------------------------
// POST /detect
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct BoxJson {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
    class: String,
}

fn handle_detect(
    stream: &mut TcpStream,
    query: &HashMap<String, String>,
    body: Vec<u8>,
    cfg: &WebConfig,
    state: &AppState,
) -> Result<()> {
    let params = match DetectParams::parse(query, cfg) {
        Ok(params) => params,
        Err(err) => {
            let body = serde_json::json!({ "error": "bad_request", "detail": format!("{:#}", err) });
            write_response(stream, 400, "application/json", body.to_string().as_bytes())?;
            return Err(err);
        }
    };
    let conf = params.config.confidence();

    let source = match params.source.as_str() {
        "image" => {
            let image = if body.is_empty() {
                StillImage::Path(cfg.default_image.clone())
            } else {
                StillImage::Bytes(body)
            };
            let body = match state.detect_still(image, conf) {
                Ok(result) => {
                    let boxes: Vec<BoxJson> = result
                        .detections
                        .iter()
                        .map(|d| BoxJson {
                            x1: d.bbox.x1,
                            y1: d.bbox.y1,
                            x2: d.bbox.x2,
                            y2: d.bbox.y2,
                            confidence: d.confidence,
                            class: result.class_name(d.class_id).to_string(),
                        })
                        .collect();
                    serde_json::json!({ "status": "done", "detections": boxes })
                }
                Err(err) => serde_json::json!({ "status": "failed", "error": err.kind(), "detail": err.to_string() }),
            };
            return write_response(stream, 200, "application/json", body.to_string().as_bytes());
        }
        "webcam" => (VideoSource::Device(params.index.unwrap_or(cfg.webcam_index)), None),
        "rtsp" => (VideoSource::Stream(params.url.clone()), None),
        "youtube" => (VideoSource::Remote(params.url.clone()), None),
        "stored" => match cfg.videos.get(&params.name) {
            Some(path) => (VideoSource::Local(path.clone()), None),
            None => {
                write_json_response(stream, 400, r#"{"error":"unknown_stored_video"}"#)?;
                return Err(anyhow!("no stored video named '{}'", params.name));
            }
        },
        "video" => match UploadedVideo::persist(&params.name, &body) {
            Ok(upload) => (upload.source(), Some(upload)),
            Err(err) => {
                state.slot().notify(Notice::error(err.to_string()));
                let body = serde_json::json!({ "error": err.kind(), "detail": err.to_string() });
                write_response(stream, 400, "application/json", body.to_string().as_bytes())?;
                return Err(err.into());
            }
        },
        other => {
            write_json_response(stream, 400, r#"{"error":"unknown_source"}"#)?;
            return Err(anyhow!("unknown source '{}'", other));
        }
    };

    let (source, upload) = source;
    let kind = source.kind();
    state.start_session(params.config, source, upload);
    let body = serde_json::json!({ "status": "started", "source": kind });
    write_response(stream, 202, "application/json", body.to_string().as_bytes())
}

#[derive(Debug)]
struct DetectParams {
    source: String,
    url: String,
    name: String,
    index: Option<u32>,
    config: PipelineConfig,
}

impl DetectParams {
    fn parse(query: &HashMap<String, String>, cfg: &WebConfig) -> Result<Self> {
        let get = |key: &str| query.get(key).map(|v| v.trim()).unwrap_or("");

        let source = get("source").to_ascii_lowercase();
        if source.is_empty() {
            return Err(anyhow!("missing source parameter"));
        }
        let tracker = match get("tracker") {
            "" | "none" | "no" => None,
            name => Some(name.parse::<TrackerPreset>()?),
        };
        let mode = InferenceMode::from_tracker(tracker);
        let config = match get("conf") {
            "" => PipelineConfig::new(cfg.default_confidence, mode)?,
            raw => {
                let percent: u8 = raw
                    .parse()
                    .map_err(|_| anyhow!("conf must be an integer percentage, got '{}'", raw))?;
                PipelineConfig::from_percent(percent, mode)?
            }
        };
        let index = match get("index") {
            "" => None,
            raw => Some(
                raw.parse()
                    .map_err(|_| anyhow!("index must be a non-negative integer, got '{}'", raw))?,
            ),
        };

        Ok(Self {
            source,
            url: get("url").to_string(),
            name: get("name").to_string(),
            index,
            config,
        })
    }
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

enum RequestError {
    TooLarge(u64),
    Malformed(anyhow::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Malformed(err.into())
    }
}

fn malformed(message: &str) -> RequestError {
    RequestError::Malformed(anyhow!("{}", message))
}

fn read_request(stream: &mut TcpStream, body_limit: u64) -> Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(malformed("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(malformed("request headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| malformed("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| malformed("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| malformed("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: u64 = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| malformed("invalid content-length"))?,
        None => 0,
    };
    if content_length > body_limit {
        return Err(RequestError::TooLarge(content_length));
    }

    let mut body = data.split_off(header_end + 4);
    let wanted = content_length as usize;
    if body.len() < wanted {
        body.reserve(wanted - body.len());
        let remaining = (wanted - body.len()) as u64;
        Read::by_ref(stream).take(remaining).read_to_end(&mut body)?;
        if body.len() < wanted {
            return Err(malformed("request body shorter than content-length"));
        }
    }
    body.truncate(wanted);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        body,
    })
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
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
