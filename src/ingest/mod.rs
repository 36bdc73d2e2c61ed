//! Video capture backends.
//!
//! This module provides the capture capability the frame pipeline consumes:
//! - Synthetic `stub://` streams (always available, used by tests and offline demos)
//! - Local files, RTSP and HTTP streams (feature: capture-ffmpeg)
//! - Local webcams by device index (feature: capture-v4l2)
//!
//! A backend turns a `CaptureTarget` into an open `VideoCapture` handle. Handles
//! produce BGR frames, report end of stream as `Ok(None)`, and are released
//! explicitly by their owner.

#[cfg(feature = "capture-ffmpeg")]
pub(crate) mod ffmpeg;
#[cfg(feature = "capture-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub(crate) mod v4l2;

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::PathBuf;

use crate::frame::Frame;

pub use synthetic::{SyntheticCapture, SyntheticConfig};

/// Scheme prefix selecting the synthetic backend.
pub const STUB_SCHEME: &str = "stub://";

/// What a capture backend is asked to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureTarget {
    /// Local capture device by index (0 = first webcam).
    Device(u32),
    /// Network stream or direct media URL.
    Url(String),
    /// Local video file.
    Path(PathBuf),
}

impl CaptureTarget {
    fn stub_spec(&self) -> Option<String> {
        let raw = match self {
            CaptureTarget::Device(_) => return None,
            CaptureTarget::Url(url) => url.clone(),
            CaptureTarget::Path(path) => path.to_string_lossy().into_owned(),
        };
        raw.starts_with(STUB_SCHEME).then_some(raw)
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTarget::Device(index) => write!(f, "device {}", index),
            CaptureTarget::Url(url) => write!(f, "{}", url),
            CaptureTarget::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// An open capture handle.
pub trait VideoCapture {
    /// True until the handle is released or the backend has given up on the stream.
    fn is_open(&self) -> bool;

    /// Read the next frame.
    ///
    /// `Ok(None)` means the stream ended (or dropped); `Err` means a frame could not
    /// be decoded.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying OS handle. Callers invoke this exactly once.
    fn release(&mut self);
}

/// Opens capture handles.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, target: &CaptureTarget) -> Result<Box<dyn VideoCapture>>;
}

/// Dispatches to the synthetic, FFmpeg or V4L2 backend depending on the target.
#[derive(Clone, Debug, Default)]
pub struct DefaultCaptureBackend;

impl DefaultCaptureBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for DefaultCaptureBackend {
    fn open(&self, target: &CaptureTarget) -> Result<Box<dyn VideoCapture>> {
        if let Some(spec) = target.stub_spec() {
            let config = SyntheticConfig::parse(&spec)?;
            return Ok(Box::new(SyntheticCapture::open(config)));
        }

        match target {
            CaptureTarget::Device(index) => open_device(*index),
            CaptureTarget::Url(url) => {
                let parsed = url::Url::parse(url)
                    .with_context(|| format!("malformed stream url '{}'", url))?;
                if parsed.host_str().map_or(true, str::is_empty) {
                    return Err(anyhow!("stream url '{}' has no host", url));
                }
                open_media(url)
            }
            CaptureTarget::Path(path) => {
                if !path.is_file() {
                    return Err(anyhow!("video file {} does not exist", path.display()));
                }
                open_media(&path.to_string_lossy())
            }
        }
    }
}

#[cfg(feature = "capture-v4l2")]
fn open_device(index: u32) -> Result<Box<dyn VideoCapture>> {
    Ok(Box::new(v4l2::V4l2Capture::open(index)?))
}

#[cfg(not(feature = "capture-v4l2"))]
fn open_device(index: u32) -> Result<Box<dyn VideoCapture>> {
    Err(anyhow!(
        "webcam {} unavailable: capture requires the capture-v4l2 feature",
        index
    ))
}

#[cfg(feature = "capture-ffmpeg")]
fn open_media(location: &str) -> Result<Box<dyn VideoCapture>> {
    Ok(Box::new(ffmpeg::FfmpegCapture::open(location)?))
}

#[cfg(not(feature = "capture-ffmpeg"))]
fn open_media(location: &str) -> Result<Box<dyn VideoCapture>> {
    Err(anyhow!(
        "cannot open {}: media decoding requires the capture-ffmpeg feature",
        location
    ))
}
