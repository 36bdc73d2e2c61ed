use std::sync::Arc;

use anyhow::Result;

use super::backend::DetectorBackend;
use super::backends::ColorBackend;
use super::result::DetectionResult;
use super::tracker::{MultiObjectTracker, TrackerPreset};
use crate::config::{AppConfig, BackendKind};
use crate::frame::Frame;

/// Pretrained detector as the frame pipeline sees it.
pub trait Model: Send {
    /// Called once before the first frame of every pipeline session. Tracking
    /// state never carries over from a previous session.
    fn begin_session(&mut self) {}

    /// Plain detection on one frame.
    fn predict(&mut self, frame: &Frame, confidence: f32) -> Result<DetectionResult>;

    /// Detection plus tracking. With `persist` the tracker carries identities
    /// over from the previous call; without it the tracker starts fresh.
    fn track(
        &mut self,
        frame: &Frame,
        confidence: f32,
        persist: bool,
        preset: TrackerPreset,
    ) -> Result<DetectionResult>;
}

/// Detector backend plus an optional tracker and the class names.
pub struct YoloModel {
    backend: Box<dyn DetectorBackend>,
    names: Arc<Vec<String>>,
    tracker: Option<MultiObjectTracker>,
}

impl YoloModel {
    pub fn new(backend: Box<dyn DetectorBackend>, names: Vec<String>) -> Self {
        Self {
            backend,
            names: Arc::new(names),
            tracker: None,
        }
    }

    fn tracker_for(&mut self, persist: bool, preset: TrackerPreset) -> &mut MultiObjectTracker {
        let reuse = persist
            && self
                .tracker
                .as_ref()
                .is_some_and(|tracker| tracker.preset() == preset);
        if !reuse {
            log::debug!("YoloModel: starting {} tracker", preset);
            self.tracker = Some(MultiObjectTracker::new(preset));
        }
        self.tracker
            .get_or_insert_with(|| MultiObjectTracker::new(preset))
    }
}

impl Model for YoloModel {
    fn begin_session(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            log::debug!("YoloModel: resetting {} tracker for a new session", tracker.preset());
            tracker.reset();
        }
    }

    fn predict(&mut self, frame: &Frame, confidence: f32) -> Result<DetectionResult> {
        let detections = self.backend.detect(frame, confidence)?;
        Ok(DetectionResult {
            frame: frame.clone(),
            detections,
            names: Arc::clone(&self.names),
        })
    }

    fn track(
        &mut self,
        frame: &Frame,
        confidence: f32,
        persist: bool,
        preset: TrackerPreset,
    ) -> Result<DetectionResult> {
        // The tracker needs low-score boxes for its rescue stage, so the backend
        // runs at the tracker's floor and the caller's threshold gates output.
        let floor = preset.settings().low_thresh.min(confidence);
        let raw = self.backend.detect(frame, floor)?;
        let tracked = self.tracker_for(persist, preset).update(&raw);
        let detections = tracked
            .into_iter()
            .filter(|d| d.confidence >= confidence)
            .collect();
        Ok(DetectionResult {
            frame: frame.clone(),
            detections,
            names: Arc::clone(&self.names),
        })
    }
}

/// Build the model named by the configuration.
pub fn load_model(config: &AppConfig) -> Result<YoloModel> {
    let mut backend: Box<dyn DetectorBackend> = match config.backend {
        BackendKind::Color => Box::new(ColorBackend::new()),
        BackendKind::Tract => tract_backend(config)?,
    };
    backend.warm_up()?;
    log::info!(
        "model ready: backend={} classes={:?}",
        backend.name(),
        config.class_names
    );
    Ok(YoloModel::new(backend, config.class_names.clone()))
}

#[cfg(feature = "backend-tract")]
fn tract_backend(config: &AppConfig) -> Result<Box<dyn DetectorBackend>> {
    Ok(Box::new(super::backends::TractBackend::new(
        &config.model_path,
        config.input_size,
        config.class_names.len(),
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_backend(_config: &AppConfig) -> Result<Box<dyn DetectorBackend>> {
    anyhow::bail!("backend 'tract' requires the backend-tract feature; use backend 'color'")
}
