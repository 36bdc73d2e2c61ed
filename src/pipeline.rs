//! Frame pipeline loop.
//!
//! One invocation opens a source, then repeats read → resize → infer → plot →
//! show until the stream ends, a step fails, or the session is cancelled. The
//! loop is synchronous: no frame is skipped, buffered or processed twice.
//!
//! Every failure becomes exactly one error notice on the sink and the report's
//! outcome. The capture handle is released exactly once on every exit path.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;

use crate::detect::{DetectionResult, Model, TrackerPreset};
use crate::display::{DisplaySink, Notice};
use crate::error::PipelineError;
use crate::frame::{ChannelOrder, Frame};
use crate::ingest::{CaptureBackend, VideoCapture};
use crate::resolve::UrlResolver;
use crate::source::{open_source, VideoSource};

pub const VIDEO_CAPTION: &str = "Detected Video";
pub const IMAGE_CAPTION: &str = "Detected Image";

/// Slider bounds of the confidence control, in percent.
pub const MIN_CONFIDENCE_PERCENT: u8 = 25;
pub const MAX_CONFIDENCE_PERCENT: u8 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferenceMode {
    Detect,
    Track(TrackerPreset),
}

impl InferenceMode {
    /// `None` selects plain detection.
    pub fn from_tracker(preset: Option<TrackerPreset>) -> Self {
        preset.map_or(InferenceMode::Detect, InferenceMode::Track)
    }
}

/// Settings for one loop invocation. Fixed for the loop's lifetime.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineConfig {
    confidence: f32,
    mode: InferenceMode,
}

impl PipelineConfig {
    pub fn new(confidence: f32, mode: InferenceMode) -> anyhow::Result<Self> {
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(anyhow!("confidence must be in (0, 1], got {}", confidence));
        }
        Ok(Self { confidence, mode })
    }

    /// Build from the UI slider value (25-100).
    pub fn from_percent(percent: u8, mode: InferenceMode) -> anyhow::Result<Self> {
        if !(MIN_CONFIDENCE_PERCENT..=MAX_CONFIDENCE_PERCENT).contains(&percent) {
            return Err(anyhow!(
                "confidence must be between {} and {} percent, got {}",
                MIN_CONFIDENCE_PERCENT,
                MAX_CONFIDENCE_PERCENT,
                percent
            ));
        }
        Self::new(f32::from(percent) / 100.0, mode)
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn mode(&self) -> InferenceMode {
        self.mode
    }
}

/// Cooperative stop flag, checked once per loop iteration.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// The stream ended or the handle closed.
    Completed,
    Cancelled,
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct PipelineReport {
    /// Frames shown on the sink.
    pub frames: u64,
    pub outcome: Outcome,
}

impl PipelineReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match &self.outcome {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Open `source` and run the loop over it.
pub fn run_source(
    config: &PipelineConfig,
    source: &VideoSource,
    backend: &dyn CaptureBackend,
    resolver: &dyn UrlResolver,
    model: &mut dyn Model,
    sink: &dyn DisplaySink,
    cancel: &CancelToken,
) -> PipelineReport {
    log::info!(
        "pipeline: starting {} (conf={:.2}, mode={:?})",
        source,
        config.confidence,
        config.mode
    );
    let mut capture = match open_source(source, backend, resolver, sink) {
        Ok(capture) => capture,
        Err(err) => return fail(sink, 0, err),
    };
    run_capture(config, capture.as_mut(), model, sink, cancel)
}

/// Run the loop over an already open handle, releasing it on exit.
///
/// The model starts a fresh session before the first read.
pub fn run_capture(
    config: &PipelineConfig,
    capture: &mut dyn VideoCapture,
    model: &mut dyn Model,
    sink: &dyn DisplaySink,
    cancel: &CancelToken,
) -> PipelineReport {
    model.begin_session();
    let mut frames = 0u64;
    let result = drive(config, capture, model, sink, cancel, &mut frames);
    capture.release();

    match result {
        Ok(outcome) => {
            log::info!("pipeline: {:?} after {} frames", outcome, frames);
            PipelineReport { frames, outcome }
        }
        Err(err) => fail(sink, frames, err),
    }
}

fn drive(
    config: &PipelineConfig,
    capture: &mut dyn VideoCapture,
    model: &mut dyn Model,
    sink: &dyn DisplaySink,
    cancel: &CancelToken,
    frames: &mut u64,
) -> Result<Outcome, PipelineError> {
    while capture.is_open() {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let frame = match capture.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => return Err(PipelineError::decode(&err)),
        };
        process_frame(config, &frame, model, sink)?;
        *frames += 1;
    }
    Ok(Outcome::Completed)
}

fn process_frame(
    config: &PipelineConfig,
    frame: &Frame,
    model: &mut dyn Model,
    sink: &dyn DisplaySink,
) -> Result<(), PipelineError> {
    let resized = frame
        .resize_for_display()
        .map_err(|err| PipelineError::decode(&err))?;
    let result = match config.mode {
        InferenceMode::Track(preset) => model.track(&resized, config.confidence, true, preset),
        InferenceMode::Detect => model.predict(&resized, config.confidence),
    }
    .map_err(|err| PipelineError::inference(&err))?;
    let annotated = result
        .plot()
        .map_err(|err| PipelineError::inference(&err))?;
    sink.show(&annotated, VIDEO_CAPTION, ChannelOrder::Bgr)
        .map_err(|err| PipelineError::display(&err))
}

fn fail(sink: &dyn DisplaySink, frames: u64, err: PipelineError) -> PipelineReport {
    log::error!("pipeline: {} failure after {} frames: {}", err.kind(), frames, err);
    sink.notify(Notice::error(err.to_string()));
    PipelineReport {
        frames,
        outcome: Outcome::Failed(err),
    }
}

/// Detect on one still image and show the plotted result.
///
/// The image is used at its own size; only video frames are resized.
pub fn detect_image(
    path: &Path,
    confidence: f32,
    model: &mut dyn Model,
    sink: &dyn DisplaySink,
) -> Result<DetectionResult, PipelineError> {
    let frame = if path.is_file() {
        Frame::load(path).map_err(|err| PipelineError::decode(&err))
    } else {
        Err(PipelineError::SourceUnavailable(format!(
            "image {} not found",
            path.display()
        )))
    };
    match frame {
        Ok(frame) => detect_frame(&frame, confidence, model, sink),
        Err(err) => {
            sink.notify(Notice::error(err.to_string()));
            Err(err)
        }
    }
}

/// Detect on an already decoded still image (uploads).
pub fn detect_frame(
    frame: &Frame,
    confidence: f32,
    model: &mut dyn Model,
    sink: &dyn DisplaySink,
) -> Result<DetectionResult, PipelineError> {
    let shown = model
        .predict(frame, confidence)
        .map_err(|err| PipelineError::inference(&err))
        .and_then(|result| {
            let annotated = result
                .plot()
                .map_err(|err| PipelineError::inference(&err))?;
            sink.show(&annotated, IMAGE_CAPTION, annotated.channels())
                .map_err(|err| PipelineError::display(&err))?;
            Ok(result)
        });
    match &shown {
        Ok(result) => log::info!("image detection: {} objects", result.detections.len()),
        Err(err) => {
            log::error!("image detection failed: {}", err);
            sink.notify(Notice::error(err.to_string()));
        }
    }
    shown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ColorBackend, YoloModel};
    use crate::display::{DisplaySlot, NoticeLevel};
    use crate::ingest::DefaultCaptureBackend;
    use crate::resolve::YtDlpResolver;

    fn color_model() -> YoloModel {
        YoloModel::new(Box::new(ColorBackend::new()), vec!["tomato".into()])
    }

    #[test]
    fn confidence_bounds_are_enforced() {
        assert!(PipelineConfig::new(0.0, InferenceMode::Detect).is_err());
        assert!(PipelineConfig::new(1.01, InferenceMode::Detect).is_err());
        assert!(PipelineConfig::new(f32::NAN, InferenceMode::Detect).is_err());
        assert!(PipelineConfig::new(1.0, InferenceMode::Detect).is_ok());
        assert!(PipelineConfig::from_percent(24, InferenceMode::Detect).is_err());
        let cfg = PipelineConfig::from_percent(40, InferenceMode::Detect).expect("40%");
        assert!((cfg.confidence() - 0.40).abs() < 1e-6);
    }

    #[test]
    fn synthetic_stream_runs_to_completion() {
        let slot = DisplaySlot::new();
        let config = PipelineConfig::new(0.4, InferenceMode::Detect).expect("config");
        let report = run_source(
            &config,
            &VideoSource::Stream("stub://cam?frames=5".into()),
            &DefaultCaptureBackend::new(),
            &YtDlpResolver::default(),
            &mut color_model(),
            &slot,
            &CancelToken::new(),
        );
        assert!(matches!(report.outcome, Outcome::Completed));
        assert_eq!(report.frames, 5);
        let snapshot = slot.snapshot();
        assert_eq!(snapshot.caption, VIDEO_CAPTION);
        assert_eq!(snapshot.seq, 5);
        assert!(snapshot.notices.is_empty());
    }

    /// Records the track ids shown on every tracked frame.
    struct TrackIds {
        inner: YoloModel,
        frames: Vec<Vec<u32>>,
    }

    impl Model for TrackIds {
        fn begin_session(&mut self) {
            self.frames.clear();
            self.inner.begin_session();
        }

        fn predict(&mut self, frame: &Frame, confidence: f32) -> anyhow::Result<DetectionResult> {
            self.inner.predict(frame, confidence)
        }

        fn track(
            &mut self,
            frame: &Frame,
            confidence: f32,
            persist: bool,
            preset: TrackerPreset,
        ) -> anyhow::Result<DetectionResult> {
            let result = self.inner.track(frame, confidence, persist, preset)?;
            self.frames
                .push(result.detections.iter().filter_map(|d| d.track_id).collect());
            Ok(result)
        }
    }

    #[test]
    fn tracking_restarts_with_every_session() {
        let config =
            PipelineConfig::new(0.4, InferenceMode::Track(TrackerPreset::ByteTrack)).expect("config");
        let mut model = TrackIds {
            inner: color_model(),
            frames: Vec::new(),
        };
        let slot = DisplaySlot::new();

        for url in ["stub://first?frames=40", "stub://second?frames=3"] {
            let report = run_source(
                &config,
                &VideoSource::Stream(url.into()),
                &DefaultCaptureBackend::new(),
                &YtDlpResolver::default(),
                &mut model,
                &slot,
                &CancelToken::new(),
            );
            assert!(matches!(report.outcome, Outcome::Completed), "{}", url);
            assert_eq!(model.frames[..3].to_vec(), vec![vec![1u32]; 3], "{}", url);
        }
    }

    #[test]
    fn cancelled_sessions_stop_before_reading() {
        let slot = DisplaySlot::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = run_source(
            &PipelineConfig::new(0.4, InferenceMode::Track(TrackerPreset::ByteTrack))
                .expect("config"),
            &VideoSource::Device(0),
            &StubDeviceBackend,
            &YtDlpResolver::default(),
            &mut color_model(),
            &slot,
            &cancel,
        );
        assert!(matches!(report.outcome, Outcome::Cancelled));
        assert_eq!(report.frames, 0);
    }

    #[test]
    fn decode_failures_stop_with_one_error() {
        let slot = DisplaySlot::new();
        let report = run_source(
            &PipelineConfig::new(0.4, InferenceMode::Detect).expect("config"),
            &VideoSource::Stream("stub://cam?fail_at=3".into()),
            &DefaultCaptureBackend::new(),
            &YtDlpResolver::default(),
            &mut color_model(),
            &slot,
            &CancelToken::new(),
        );
        assert_eq!(report.frames, 2);
        assert_eq!(report.error().map(PipelineError::kind), Some("decode"));
        let notices = slot.snapshot().notices;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
    }

    #[test]
    fn images_are_detected_at_native_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tomato.png");
        let mut image = image::RgbImage::from_pixel(100, 80, image::Rgb([40, 140, 60]));
        for y in 20..52 {
            for x in 30..62 {
                image.put_pixel(x, y, image::Rgb([220, 30, 30]));
            }
        }
        image.save(&path)?;

        let slot = DisplaySlot::new();
        let result = detect_image(&path, 0.25, &mut color_model(), &slot)?;
        assert_eq!(result.frame.dimensions(), (100, 80));
        assert_eq!(result.detections.len(), 1);
        assert_eq!(slot.snapshot().caption, IMAGE_CAPTION);
        Ok(())
    }

    #[test]
    fn missing_images_are_unavailable() {
        let slot = DisplaySlot::new();
        let err = detect_image(
            Path::new("/definitely/not/IMG_1022.jpg"),
            0.4,
            &mut color_model(),
            &slot,
        )
        .err()
        .expect("missing image");
        assert_eq!(err.kind(), "source_unavailable");
        assert_eq!(slot.snapshot().notices.len(), 1);
    }

    /// Maps every device index to an endless synthetic stream.
    struct StubDeviceBackend;

    impl CaptureBackend for StubDeviceBackend {
        fn open(
            &self,
            _target: &crate::ingest::CaptureTarget,
        ) -> anyhow::Result<Box<dyn VideoCapture>> {
            DefaultCaptureBackend::new()
                .open(&crate::ingest::CaptureTarget::Url("stub://webcam".into()))
        }
    }
}
