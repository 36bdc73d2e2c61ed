mod backend;
mod backends;
mod model;
mod nms;
mod result;
mod tracker;

pub use backend::DetectorBackend;
pub use backends::ColorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use model::{load_model, Model, YoloModel};
pub use nms::non_max_suppression;
pub use result::{BoundingBox, Detection, DetectionResult};
pub use tracker::{MultiObjectTracker, TrackerPreset, TrackerSettings};
