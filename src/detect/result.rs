use std::sync::Arc;

use anyhow::Result;
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::frame::Frame;

const BOX_THICKNESS: u32 = 2;
const TAG_HEIGHT: u32 = 6;

/// Box colors (RGB), indexed by track id when tracking and class id otherwise.
const PALETTE: [[u8; 3]; 10] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [146, 204, 23],
    [61, 219, 134],
    [26, 147, 52],
    [0, 212, 187],
];

/// Axis-aligned box in pixel coordinates of the frame it was detected on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Clamp into a `width` x `height` frame.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
    /// Persistent identity, only set by the tracker.
    pub track_id: Option<u32>,
}

/// Detections for one frame plus the frame they were computed on.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub names: Arc<Vec<String>>,
}

impl DetectionResult {
    pub fn class_name(&self, class_id: usize) -> &str {
        self.names
            .get(class_id)
            .map(String::as_str)
            .unwrap_or("object")
    }

    /// Copy of the frame with every detection drawn as a box with a color tag.
    ///
    /// The output keeps the input's size and channel order.
    pub fn plot(&self) -> Result<Frame> {
        let (width, height) = self.frame.dimensions();
        let mut canvas = self.frame.to_rgb_image()?;

        for detection in &self.detections {
            let bbox = detection.bbox.clamped(width, height);
            let (x, y) = (bbox.x1.round() as i32, bbox.y1.round() as i32);
            let (w, h) = (bbox.width().round() as u32, bbox.height().round() as u32);
            if w == 0 || h == 0 {
                continue;
            }
            let color = Rgb(palette_color(detection));

            for inset in 0..BOX_THICKNESS.min(w / 2).min(h / 2).max(1) {
                let rect = Rect::at(x + inset as i32, y + inset as i32)
                    .of_size(w - 2 * inset, h - 2 * inset);
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }

            // Confidence tag above the box (inside it when the box touches the top edge).
            let tag_width = ((w as f32) * detection.confidence.clamp(0.0, 1.0)).round() as u32;
            if tag_width > 0 {
                let tag_y = if y >= TAG_HEIGHT as i32 {
                    y - TAG_HEIGHT as i32
                } else {
                    y
                };
                let tag = Rect::at(x, tag_y).of_size(tag_width, TAG_HEIGHT.min(h));
                draw_filled_rect_mut(&mut canvas, tag, color);
            }
        }

        Ok(Frame::from_rgb_image(canvas, self.frame.channels()))
    }
}

fn palette_color(detection: &Detection) -> [u8; 3] {
    let key = detection
        .track_id
        .map(|id| id as usize)
        .unwrap_or(detection.class_id);
    PALETTE[key % PALETTE.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChannelOrder;

    fn result_with(detections: Vec<Detection>, channels: ChannelOrder) -> DetectionResult {
        DetectionResult {
            frame: Frame::filled(64, 48, channels, [0, 0, 0]),
            detections,
            names: Arc::new(vec!["tomato".to_string()]),
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        let c = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&c) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn plot_draws_boxes_and_keeps_channel_order() -> Result<()> {
        let result = result_with(
            vec![Detection {
                bbox: BoundingBox::new(10.0, 20.0, 40.0, 40.0),
                confidence: 0.9,
                class_id: 0,
                track_id: None,
            }],
            ChannelOrder::Bgr,
        );
        let plotted = result.plot()?;
        assert_eq!(plotted.channels(), ChannelOrder::Bgr);
        assert_eq!(plotted.dimensions(), (64, 48));
        assert_eq!(plotted.rgb_at(10, 30), PALETTE[0]);
        assert_eq!(plotted.rgb_at(25, 30), [0, 0, 0]);
        // Source frame is untouched.
        assert_eq!(result.frame.rgb_at(10, 30), [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn track_ids_pick_the_color() -> Result<()> {
        let result = result_with(
            vec![Detection {
                bbox: BoundingBox::new(10.0, 20.0, 40.0, 40.0),
                confidence: 0.5,
                class_id: 0,
                track_id: Some(3),
            }],
            ChannelOrder::Rgb,
        );
        let plotted = result.plot()?;
        assert_eq!(plotted.rgb_at(10, 30), PALETTE[3]);
        Ok(())
    }

    #[test]
    fn empty_results_plot_to_the_same_pixels() -> Result<()> {
        let result = result_with(Vec::new(), ChannelOrder::Bgr);
        assert_eq!(result.plot()?, result.frame);
        Ok(())
    }

    #[test]
    fn unknown_class_ids_have_a_fallback_name() {
        let result = result_with(Vec::new(), ChannelOrder::Rgb);
        assert_eq!(result.class_name(0), "tomato");
        assert_eq!(result.class_name(7), "object");
    }
}
