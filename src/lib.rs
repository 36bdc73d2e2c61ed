//! Tomato Vision
//!
//! Object-detection demo for tomatoes. Frames come from a webcam, an RTSP
//! stream, a YouTube video or an uploaded file. Each frame is resized to the
//! display size, run through a detector (optionally with multi-object
//! tracking), annotated, and written to a single display slot that is
//! overwritten in place.
//!
//! # Module Structure
//!
//! - `pipeline`: the frame loop (open, read, resize, infer, plot, show, release)
//! - `source`: source variants and how each one is opened
//! - `ingest`: capture backends (synthetic, FFmpeg, V4L2)
//! - `resolve`: page URL to stream URL resolution (yt-dlp)
//! - `detect`: model seam, detector backends, NMS, tracker, plotting
//! - `display`: display sinks (shared web slot, image file)
//! - `web`: browser UI server
//! - `config`: application configuration (file + environment)
//! - `ui`: terminal progress for the CLI

pub mod config;
pub mod detect;
pub mod display;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod resolve;
pub mod source;
pub mod ui;
pub mod web;

pub use config::{AppConfig, BackendKind};
pub use detect::{
    load_model, BoundingBox, Detection, DetectionResult, Model, TrackerPreset, YoloModel,
};
pub use display::{DisplaySink, DisplaySlot, FileSink, Notice, NoticeLevel};
pub use error::PipelineError;
pub use frame::{ChannelOrder, Frame, DISPLAY_HEIGHT, DISPLAY_WIDTH};
pub use ingest::{CaptureBackend, CaptureTarget, DefaultCaptureBackend, VideoCapture};
pub use pipeline::{
    detect_frame, detect_image, run_capture, run_source, CancelToken, InferenceMode, Outcome,
    PipelineConfig, PipelineReport,
};
pub use resolve::{UrlResolver, YtDlpResolver};
pub use source::{open_source, UploadedVideo, VideoSource};
pub use web::{AppState, WebConfig, WebHandle, WebServer};
