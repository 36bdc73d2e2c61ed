use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use tomato_vision::detect::{BoundingBox, Detection, DetectionResult, Model, TrackerPreset};
use tomato_vision::display::{DisplaySink, Notice, NoticeLevel};
use tomato_vision::frame::{ChannelOrder, Frame, DISPLAY_HEIGHT, DISPLAY_WIDTH};
use tomato_vision::ingest::{CaptureBackend, CaptureTarget, VideoCapture};
use tomato_vision::pipeline::{
    run_source, CancelToken, InferenceMode, Outcome, PipelineConfig, VIDEO_CAPTION,
};
use tomato_vision::resolve::UrlResolver;
use tomato_vision::source::VideoSource;

// ----------------------------------------------------------------------------
// Fakes
// ----------------------------------------------------------------------------

#[derive(Default)]
struct CaptureStats {
    opens: AtomicUsize,
    reads: AtomicUsize,
    releases: AtomicUsize,
}

enum Step {
    Frame(u32, u32),
    Broken,
}

struct ScriptedCapture {
    steps: VecDeque<Step>,
    stats: Arc<CaptureStats>,
    open: bool,
}

impl VideoCapture for ScriptedCapture {
    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            Some(Step::Frame(w, h)) => Ok(Some(Frame::filled(w, h, ChannelOrder::Bgr, [30, 90, 200]))),
            Some(Step::Broken) => Err(anyhow!("corrupt packet")),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.open = false;
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one scripted capture per open; `None` script means open fails.
struct ScriptedBackend {
    script: Mutex<Option<Vec<(u32, u32)>>>,
    broken_at: Option<usize>,
    stats: Arc<CaptureStats>,
}

impl ScriptedBackend {
    fn frames(sizes: Vec<(u32, u32)>) -> Self {
        Self {
            script: Mutex::new(Some(sizes)),
            broken_at: None,
            stats: Arc::default(),
        }
    }

    fn failing() -> Self {
        Self {
            script: Mutex::new(None),
            broken_at: None,
            stats: Arc::default(),
        }
    }
}

impl CaptureBackend for ScriptedBackend {
    fn open(&self, target: &CaptureTarget) -> Result<Box<dyn VideoCapture>> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let sizes = self
            .script
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("cannot open {}", target))?;
        let mut steps: VecDeque<Step> = sizes.into_iter().map(|(w, h)| Step::Frame(w, h)).collect();
        if let Some(at) = self.broken_at {
            steps.insert(at, Step::Broken);
        }
        Ok(Box::new(ScriptedCapture {
            steps,
            stats: Arc::clone(&self.stats),
            open: true,
        }))
    }
}

struct FixedResolver(Option<&'static str>);

impl UrlResolver for FixedResolver {
    fn resolve(&self, url: &str) -> Result<String> {
        self.0
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no formats for {}", url))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Predict { conf: f32, size: (u32, u32) },
    Track { conf: f32, size: (u32, u32), persist: bool, preset: TrackerPreset },
}

/// Records every inference call; fails on the `fail_on`-th call (1-based).
#[derive(Default)]
struct RecordingModel {
    calls: Vec<Call>,
    sessions: usize,
    fail_on: Option<usize>,
}

impl RecordingModel {
    fn respond(&self, frame: &Frame) -> Result<DetectionResult> {
        if self.fail_on == Some(self.calls.len()) {
            return Err(anyhow!("session crashed"));
        }
        Ok(DetectionResult {
            frame: frame.clone(),
            detections: vec![Detection {
                bbox: BoundingBox::new(10.0, 10.0, 60.0, 60.0),
                confidence: 0.9,
                class_id: 0,
                track_id: None,
            }],
            names: Arc::new(vec!["tomato".to_string()]),
        })
    }
}

impl Model for RecordingModel {
    fn begin_session(&mut self) {
        assert!(self.calls.is_empty(), "session started after inference");
        self.sessions += 1;
    }

    fn predict(&mut self, frame: &Frame, confidence: f32) -> Result<DetectionResult> {
        self.calls.push(Call::Predict {
            conf: confidence,
            size: frame.dimensions(),
        });
        self.respond(frame)
    }

    fn track(
        &mut self,
        frame: &Frame,
        confidence: f32,
        persist: bool,
        preset: TrackerPreset,
    ) -> Result<DetectionResult> {
        self.calls.push(Call::Track {
            conf: confidence,
            size: frame.dimensions(),
            persist,
            preset,
        });
        self.respond(frame)
    }
}

#[derive(Default)]
struct RecordingSink {
    shown: Mutex<Vec<((u32, u32), String, ChannelOrder)>>,
    notices: Mutex<Vec<Notice>>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl RecordingSink {
    fn errors(&self) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.level == NoticeLevel::Error)
            .count()
    }

    fn shown(&self) -> usize {
        self.shown.lock().unwrap().len()
    }
}

impl DisplaySink for RecordingSink {
    fn show(&self, frame: &Frame, caption: &str, channels: ChannelOrder) -> Result<()> {
        let mut shown = self.shown.lock().unwrap();
        shown.push((frame.dimensions(), caption.to_string(), channels));
        if let Some((after, cancel)) = &self.cancel_after {
            if shown.len() == *after {
                cancel.cancel();
            }
        }
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

fn detect_config() -> PipelineConfig {
    PipelineConfig::new(0.4, InferenceMode::Detect).unwrap()
}

fn run(
    config: &PipelineConfig,
    source: &VideoSource,
    backend: &ScriptedBackend,
    resolver: &FixedResolver,
    model: &mut RecordingModel,
    sink: &RecordingSink,
) -> tomato_vision::pipeline::PipelineReport {
    run_source(config, source, backend, resolver, model, sink, &CancelToken::new())
}

// ----------------------------------------------------------------------------
// Open failures
// ----------------------------------------------------------------------------

#[test]
fn open_failures_run_no_inference_and_report_once() {
    let cases = vec![
        (VideoSource::Device(3), FixedResolver(None), "stream_open"),
        (
            VideoSource::Stream("rtsp://cam.invalid/live".into()),
            FixedResolver(None),
            "stream_open",
        ),
        (
            VideoSource::Remote("https://youtu.be/nothing".into()),
            FixedResolver(None),
            "resolution",
        ),
        (
            VideoSource::Remote("https://youtu.be/abc".into()),
            FixedResolver(Some("https://cdn.invalid/abc.mp4")),
            "stream_open",
        ),
        (
            VideoSource::Local(PathBuf::from("/no/such/upload.mp4")),
            FixedResolver(None),
            "source_unavailable",
        ),
    ];

    for (source, resolver, kind) in cases {
        let backend = ScriptedBackend::failing();
        let mut model = RecordingModel::default();
        let sink = RecordingSink::default();
        let report = run(&detect_config(), &source, &backend, &resolver, &mut model, &sink);

        assert_eq!(report.error().map(|e| e.kind()), Some(kind), "{}", source);
        assert_eq!(report.frames, 0);
        assert!(model.calls.is_empty(), "{}", source);
        assert_eq!(model.sessions, 0, "{}", source);
        assert_eq!(sink.shown(), 0);
        assert_eq!(sink.errors(), 1, "{}", source);
        assert_eq!(backend.stats.reads.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn empty_urls_never_reach_the_backend() {
    for source in [VideoSource::Stream(String::new()), VideoSource::Remote(" ".into())] {
        let backend = ScriptedBackend::frames(vec![(640, 480)]);
        let sink = RecordingSink::default();
        let report = run(
            &detect_config(),
            &source,
            &backend,
            &FixedResolver(Some("stub://never")),
            &mut RecordingModel::default(),
            &sink,
        );
        assert_eq!(report.error().map(|e| e.kind()), Some("source_unavailable"));
        assert_eq!(backend.stats.opens.load(Ordering::SeqCst), 0);
        assert_eq!(sink.errors(), 1);
    }
}

// ----------------------------------------------------------------------------
// Frame loop
// ----------------------------------------------------------------------------

#[test]
fn every_frame_is_resized_to_the_display_size() {
    let backend = ScriptedBackend::frames(vec![(640, 480), (1920, 1080), (100, 50), (720, 405)]);
    let mut model = RecordingModel::default();
    let sink = RecordingSink::default();
    let report = run(
        &detect_config(),
        &VideoSource::Stream("rtsp://cam/1".into()),
        &backend,
        &FixedResolver(None),
        &mut model,
        &sink,
    );

    assert!(matches!(report.outcome, Outcome::Completed));
    assert_eq!(report.frames, 4);
    for call in &model.calls {
        match call {
            Call::Predict { size, .. } => assert_eq!(*size, (DISPLAY_WIDTH, DISPLAY_HEIGHT)),
            other => panic!("unexpected call {:?}", other),
        }
    }
    for (size, caption, channels) in sink.shown.lock().unwrap().iter() {
        assert_eq!(*size, (DISPLAY_WIDTH, DISPLAY_HEIGHT));
        assert_eq!(caption, VIDEO_CAPTION);
        assert_eq!(*channels, ChannelOrder::Bgr);
    }
}

#[test]
fn tracking_always_persists_and_detection_never_tracks() {
    let sizes = vec![(640, 480); 6];

    let backend = ScriptedBackend::frames(sizes.clone());
    let mut model = RecordingModel::default();
    let config =
        PipelineConfig::new(0.55, InferenceMode::Track(TrackerPreset::BotSort)).unwrap();
    run(
        &config,
        &VideoSource::Device(0),
        &backend,
        &FixedResolver(None),
        &mut model,
        &RecordingSink::default(),
    );
    assert_eq!(model.calls.len(), 6);
    assert_eq!(model.sessions, 1);
    assert!(model.calls.iter().all(|call| matches!(
        call,
        Call::Track { persist: true, preset: TrackerPreset::BotSort, .. }
    )));

    let backend = ScriptedBackend::frames(sizes);
    let mut model = RecordingModel::default();
    run(
        &detect_config(),
        &VideoSource::Device(0),
        &backend,
        &FixedResolver(None),
        &mut model,
        &RecordingSink::default(),
    );
    assert_eq!(model.calls.len(), 6);
    assert!(model.calls.iter().all(|call| matches!(call, Call::Predict { .. })));
}

#[test]
fn every_call_uses_the_configured_confidence() {
    let backend = ScriptedBackend::frames(vec![(320, 240); 5]);
    let mut model = RecordingModel::default();
    let config = PipelineConfig::from_percent(
        73,
        InferenceMode::Track(TrackerPreset::ByteTrack),
    )
    .unwrap();
    run(
        &config,
        &VideoSource::Stream("rtsp://cam/1".into()),
        &backend,
        &FixedResolver(None),
        &mut model,
        &RecordingSink::default(),
    );
    assert_eq!(model.calls.len(), 5);
    for call in &model.calls {
        let conf = match call {
            Call::Predict { conf, .. } | Call::Track { conf, .. } => *conf,
        };
        assert_eq!(conf, config.confidence());
    }
}

#[test]
fn plain_detection_repeats_the_same_threshold() {
    let backend = ScriptedBackend::frames(vec![(640, 480); 4]);
    let mut model = RecordingModel::default();
    let config = PipelineConfig::from_percent(55, InferenceMode::Detect).unwrap();
    run(
        &config,
        &VideoSource::Device(0),
        &backend,
        &FixedResolver(None),
        &mut model,
        &RecordingSink::default(),
    );

    let expected = Call::Predict {
        conf: config.confidence(),
        size: (DISPLAY_WIDTH, DISPLAY_HEIGHT),
    };
    assert_eq!(model.calls, vec![expected; 4]);
}

#[test]
fn end_of_stream_releases_once_without_error() {
    let backend = ScriptedBackend::frames(vec![(640, 480); 3]);
    let sink = RecordingSink::default();
    let report = run(
        &detect_config(),
        &VideoSource::Remote("https://youtu.be/abc".into()),
        &backend,
        &FixedResolver(Some("https://cdn.example/abc.mp4")),
        &mut RecordingModel::default(),
        &sink,
    );

    assert!(matches!(report.outcome, Outcome::Completed));
    assert_eq!(report.frames, 3);
    assert_eq!(backend.stats.releases.load(Ordering::SeqCst), 1);
    assert_eq!(sink.errors(), 0);
    let messages: Vec<String> = sink
        .notices
        .lock()
        .unwrap()
        .iter()
        .map(|n| n.message.clone())
        .collect();
    assert_eq!(messages.last().map(String::as_str), Some("Video stream opened successfully!"));
}

#[test]
fn inference_failure_stops_reading_and_releases_once() {
    let backend = ScriptedBackend::frames(vec![(640, 480); 10]);
    let mut model = RecordingModel {
        fail_on: Some(3),
        ..RecordingModel::default()
    };
    let sink = RecordingSink::default();
    let report = run(
        &detect_config(),
        &VideoSource::Stream("rtsp://cam/1".into()),
        &backend,
        &FixedResolver(None),
        &mut model,
        &sink,
    );

    assert_eq!(report.error().map(|e| e.kind()), Some("inference"));
    assert_eq!(report.frames, 2);
    assert_eq!(model.calls.len(), 3);
    assert_eq!(backend.stats.reads.load(Ordering::SeqCst), 3);
    assert_eq!(backend.stats.releases.load(Ordering::SeqCst), 1);
    assert_eq!(sink.shown(), 2);
    assert_eq!(sink.errors(), 1);
}

#[test]
fn decode_failure_releases_once() {
    let backend = ScriptedBackend {
        broken_at: Some(1),
        ..ScriptedBackend::frames(vec![(640, 480); 4])
    };
    let sink = RecordingSink::default();
    let report = run(
        &detect_config(),
        &VideoSource::Local(PathBuf::from("stub://upload.mp4")),
        &backend,
        &FixedResolver(None),
        &mut RecordingModel::default(),
        &sink,
    );
    assert_eq!(report.error().map(|e| e.kind()), Some("decode"));
    assert_eq!(report.frames, 1);
    assert_eq!(backend.stats.releases.load(Ordering::SeqCst), 1);
    assert_eq!(sink.errors(), 1);
}

#[test]
fn cancellation_ends_the_session_quietly() {
    let cancel = CancelToken::new();
    let backend = ScriptedBackend::frames(vec![(640, 480); 50]);
    let sink = RecordingSink {
        cancel_after: Some((4, cancel.clone())),
        ..RecordingSink::default()
    };
    let report = run_source(
        &detect_config(),
        &VideoSource::Device(0),
        &backend,
        &FixedResolver(None),
        &mut RecordingModel::default(),
        &sink,
        &cancel,
    );
    assert!(matches!(report.outcome, Outcome::Cancelled));
    assert_eq!(report.frames, 4);
    assert_eq!(backend.stats.reads.load(Ordering::SeqCst), 4);
    assert_eq!(backend.stats.releases.load(Ordering::SeqCst), 1);
    assert_eq!(sink.errors(), 0);
}
