use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const CELL_SIZE: u32 = 16;
/// Fraction of ripe-red pixels that makes a cell part of a fruit.
const CELL_FILL: f32 = 0.3;
const MIN_RED: u8 = 100;
const RED_DOMINANCE: f32 = 1.6;

/// Color-segmentation backend for ripe tomatoes.
///
/// Splits the frame into 16px cells, marks cells dominated by ripe-red
/// pixels, and reports each 4-connected group of marked cells as one
/// detection of class 0. Confidence is the mean fill of the group's cells.
/// Needs no model file, so it is the fallback when ONNX support is not
/// compiled in.
#[derive(Default)]
pub struct ColorBackend;

impl ColorBackend {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone, Copy, Default)]
struct Cell {
    red: u32,
    total: u32,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Cell {
    fn fill(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.red as f32 / self.total as f32
        }
    }

    fn add(&mut self, x: u32, y: u32, red: bool) {
        self.total += 1;
        if !red {
            return;
        }
        if self.red == 0 {
            (self.min_x, self.min_y, self.max_x, self.max_y) = (x, y, x, y);
        } else {
            self.min_x = self.min_x.min(x);
            self.min_y = self.min_y.min(y);
            self.max_x = self.max_x.max(x);
            self.max_y = self.max_y.max(y);
        }
        self.red += 1;
    }
}

fn is_ripe_red([r, g, b]: [u8; 3]) -> bool {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    r >= MIN_RED && rf > gf * RED_DOMINANCE && rf > bf * RED_DOMINANCE
}

impl DetectorBackend for ColorBackend {
    fn name(&self) -> &'static str {
        "color"
    }

    fn detect(&mut self, frame: &Frame, confidence: f32) -> Result<Vec<Detection>> {
        let (width, height) = frame.dimensions();
        let cols = width.div_ceil(CELL_SIZE) as usize;
        let rows = height.div_ceil(CELL_SIZE) as usize;
        let mut cells = vec![Cell::default(); cols * rows];

        for y in 0..height {
            let row = (y / CELL_SIZE) as usize;
            for x in 0..width {
                let col = (x / CELL_SIZE) as usize;
                cells[row * cols + col].add(x, y, is_ripe_red(frame.rgb_at(x, y)));
            }
        }

        let marked: Vec<bool> = cells.iter().map(|c| c.fill() >= CELL_FILL).collect();
        let mut visited = vec![false; cells.len()];
        let mut detections = Vec::new();

        for start in 0..cells.len() {
            if !marked[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            let mut stack = vec![start];
            let mut fill_sum = 0.0;
            let mut count = 0usize;
            let mut bbox: Option<BoundingBox> = None;

            while let Some(index) = stack.pop() {
                let cell = &cells[index];
                fill_sum += cell.fill();
                count += 1;
                let cell_box = BoundingBox::new(
                    cell.min_x as f32,
                    cell.min_y as f32,
                    (cell.max_x + 1) as f32,
                    (cell.max_y + 1) as f32,
                );
                bbox = Some(match bbox {
                    None => cell_box,
                    Some(b) => BoundingBox::new(
                        b.x1.min(cell_box.x1),
                        b.y1.min(cell_box.y1),
                        b.x2.max(cell_box.x2),
                        b.y2.max(cell_box.y2),
                    ),
                });

                let (row, col) = (index / cols, index % cols);
                let mut neighbours = Vec::with_capacity(4);
                if row > 0 {
                    neighbours.push(index - cols);
                }
                if row + 1 < rows {
                    neighbours.push(index + cols);
                }
                if col > 0 {
                    neighbours.push(index - 1);
                }
                if col + 1 < cols {
                    neighbours.push(index + 1);
                }
                for next in neighbours {
                    if marked[next] && !visited[next] {
                        visited[next] = true;
                        stack.push(next);
                    }
                }
            }

            let score = fill_sum / count as f32;
            if let Some(bbox) = bbox {
                if score >= confidence {
                    detections.push(Detection {
                        bbox,
                        confidence: score,
                        class_id: 0,
                        track_id: None,
                    });
                }
            }
        }

        Ok(detections)
    }
}
