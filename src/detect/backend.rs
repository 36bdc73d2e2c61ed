use anyhow::Result;

use super::result::Detection;
use crate::frame::Frame;

/// Raw detector.
///
/// A backend maps one frame to boxes in that frame's pixel coordinates. It
/// does not track, plot or keep frames between calls; `YoloModel` layers
/// tracking and result assembly on top.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection, keeping only boxes scoring at least `confidence`.
    ///
    /// Implementations must accept both channel orders.
    fn detect(&mut self, frame: &Frame, confidence: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
