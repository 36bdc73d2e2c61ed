//! Video sources and how each one is opened.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::display::{DisplaySink, Notice};
use crate::error::PipelineError;
use crate::ingest::{CaptureBackend, CaptureTarget, VideoCapture, STUB_SCHEME};
use crate::resolve::UrlResolver;

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoSource {
    /// Local capture device by index.
    Device(u32),
    /// RTSP (or any directly decodable) stream URL.
    Stream(String),
    /// Page URL that must be resolved to a stream URL first (YouTube).
    Remote(String),
    /// Video file on disk, typically an upload.
    Local(PathBuf),
}

impl VideoSource {
    pub fn kind(&self) -> &'static str {
        match self {
            VideoSource::Device(_) => "webcam",
            VideoSource::Stream(_) => "rtsp",
            VideoSource::Remote(_) => "youtube",
            VideoSource::Local(_) => "video",
        }
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSource::Device(index) => write!(f, "webcam {}", index),
            VideoSource::Stream(url) => write!(f, "rtsp {}", url),
            VideoSource::Remote(url) => write!(f, "youtube {}", url),
            VideoSource::Local(path) => write!(f, "video {}", path.display()),
        }
    }
}

/// Extensions accepted for uploaded videos.
pub const VIDEO_UPLOAD_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// An uploaded video persisted to a temporary file.
///
/// The file is removed when the value is dropped, so it must outlive the
/// session reading it.
pub struct UploadedVideo {
    file: NamedTempFile,
}

impl UploadedVideo {
    /// Write `bytes` to a temporary file keeping the upload's extension, so
    /// container sniffing by extension still works.
    pub fn persist(name: &str, bytes: &[u8]) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::Upload(format!("{} is empty", display_name(name))));
        }
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !VIDEO_UPLOAD_EXTENSIONS.contains(&extension.as_str()) {
            return Err(PipelineError::Upload(format!(
                "{} is not a supported video type ({})",
                display_name(name),
                VIDEO_UPLOAD_EXTENSIONS.join(", ")
            )));
        }
        let suffix = format!(".{}", extension);
        let mut file = tempfile::Builder::new()
            .prefix("tomato-upload-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| PipelineError::Upload(format!("cannot create temporary file: {}", e)))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| PipelineError::Upload(format!("cannot write {}: {}", display_name(name), e)))?;

        log::info!(
            "UploadedVideo: stored {} ({} bytes) at {}",
            display_name(name),
            bytes.len(),
            file.path().display()
        );
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn source(&self) -> VideoSource {
        VideoSource::Local(self.path().to_path_buf())
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "upload"
    } else {
        name
    }
}

/// Open a capture handle for `source`.
///
/// Remote sources are resolved first and report progress through `sink`.
/// A handle that opens but reports itself closed is released and treated as
/// an open failure.
pub fn open_source(
    source: &VideoSource,
    backend: &dyn CaptureBackend,
    resolver: &dyn UrlResolver,
    sink: &dyn DisplaySink,
) -> Result<Box<dyn VideoCapture>, PipelineError> {
    let target = match source {
        VideoSource::Device(index) => CaptureTarget::Device(*index),
        VideoSource::Stream(url) => {
            let url = url.trim();
            if url.is_empty() {
                return Err(PipelineError::SourceUnavailable(
                    "Please enter an RTSP URL".to_string(),
                ));
            }
            CaptureTarget::Url(url.to_string())
        }
        VideoSource::Remote(url) => {
            let url = url.trim();
            if url.is_empty() {
                return Err(PipelineError::SourceUnavailable(
                    "Please enter a YouTube URL".to_string(),
                ));
            }
            sink.notify(Notice::info("Extracting video stream URL..."));
            let resolved = resolver
                .resolve(url)
                .map_err(|err| PipelineError::resolution(url, &err))?;
            sink.notify(Notice::info("Opening video stream..."));
            CaptureTarget::Url(resolved)
        }
        VideoSource::Local(path) => {
            let is_stub = path.to_string_lossy().starts_with(STUB_SCHEME);
            if !is_stub && !path.is_file() {
                return Err(PipelineError::SourceUnavailable(format!(
                    "video file {} not found",
                    path.display()
                )));
            }
            CaptureTarget::Path(path.clone())
        }
    };

    let mut capture = backend
        .open(&target)
        .map_err(|err| PipelineError::stream_open(&target, &err))?;
    if !capture.is_open() {
        capture.release();
        return Err(PipelineError::StreamOpen {
            target: target.to_string(),
            reason: "capture reported closed right after opening".to_string(),
        });
    }

    if matches!(source, VideoSource::Remote(_)) {
        sink.notify(Notice::success("Video stream opened successfully!"));
    }
    log::info!("opened {} as {}", source, target);
    Ok(capture)
}
