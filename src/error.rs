//! User-visible failure taxonomy for the frame pipeline.
//!
//! Internals propagate `anyhow::Error`; the pipeline boundary converts those into
//! a `PipelineError` so the UI can show one message per failed invocation.
//! End of stream has no variant; it is a normal termination.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source cannot be used at all (missing device, empty URL, missing file).
    #[error("video source not available: {0}")]
    SourceUnavailable(String),

    /// The capture backend refused to open the target or opened it closed.
    #[error("failed to open video stream {target}: {reason}")]
    StreamOpen { target: String, reason: String },

    /// The remote URL could not be turned into a direct stream URL.
    #[error("failed to resolve {url}: {reason}")]
    Resolution { url: String, reason: String },

    /// A frame read failed mid-stream for a reason other than end of data.
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// The model (or plotting its result) failed.
    #[error("model inference failed: {0}")]
    Inference(String),

    /// The annotated frame could not be rendered into the display.
    #[error("display failed: {0}")]
    Display(String),

    /// The detector is still held by a session that is shutting down.
    #[error("detector busy: {0}")]
    Busy(String),

    /// An uploaded file could not be persisted.
    #[error("upload rejected: {0}")]
    Upload(String),
}

impl PipelineError {
    pub fn stream_open(target: impl ToString, err: &anyhow::Error) -> Self {
        Self::StreamOpen {
            target: target.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub fn resolution(url: impl ToString, err: &anyhow::Error) -> Self {
        Self::Resolution {
            url: url.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub fn decode(err: &anyhow::Error) -> Self {
        Self::Decode(format!("{:#}", err))
    }

    pub fn inference(err: &anyhow::Error) -> Self {
        Self::Inference(format!("{:#}", err))
    }

    pub fn display(err: &anyhow::Error) -> Self {
        Self::Display(format!("{:#}", err))
    }

    /// Short machine-readable kind, used by the status endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::StreamOpen { .. } => "stream_open",
            Self::Resolution { .. } => "resolution",
            Self::Decode(_) => "decode",
            Self::Inference(_) => "inference",
            Self::Display(_) => "display",
            Self::Busy(_) => "busy",
            Self::Upload(_) => "upload",
        }
    }
}
