//! Multi-object tracking over per-frame detections.
//!
//! Two presets share one motion-only tracker:
//! - `bytetrack.yaml`: two-stage IoU association, high-score detections first,
//!   low-score detections then rescue tracks the first stage missed.
//! - `botsort.yaml`: the same association with an extra proximity gate that
//!   rejects first-stage pairs whose raw IoU is too low, regardless of score.
//!
//! New tracks are tentative until they are matched a second time, except on
//! the very first frame of a session. Confirmed tracks that go unmatched are
//! kept (and predicted forward) for `track_buffer` frames before being dropped.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};

use super::result::{BoundingBox, Detection};

/// IoU cost ceiling for the low-score rescue stage.
const RESCUE_MATCH_THRESH: f32 = 0.5;
/// IoU cost ceiling for confirming tentative tracks.
const TENTATIVE_MATCH_THRESH: f32 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackerPreset {
    ByteTrack,
    BotSort,
}

impl TrackerPreset {
    /// Name the preset is selected by in the UI.
    pub fn config_name(&self) -> &'static str {
        match self {
            TrackerPreset::ByteTrack => "bytetrack.yaml",
            TrackerPreset::BotSort => "botsort.yaml",
        }
    }

    pub fn settings(&self) -> TrackerSettings {
        let bytetrack = TrackerSettings {
            high_thresh: 0.25,
            low_thresh: 0.1,
            new_track_thresh: 0.25,
            track_buffer: 30,
            match_thresh: 0.8,
            fuse_score: true,
            proximity_thresh: None,
        };
        match self {
            TrackerPreset::ByteTrack => bytetrack,
            TrackerPreset::BotSort => TrackerSettings {
                proximity_thresh: Some(0.5),
                ..bytetrack
            },
        }
    }
}

impl fmt::Display for TrackerPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_name())
    }
}

impl FromStr for TrackerPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.strip_suffix(".yaml").unwrap_or(&name) {
            "bytetrack" => Ok(TrackerPreset::ByteTrack),
            "botsort" => Ok(TrackerPreset::BotSort),
            _ => Err(anyhow!(
                "unknown tracker '{}' (expected bytetrack.yaml or botsort.yaml)",
                s
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerSettings {
    /// Detections at or above this score take part in the first association.
    pub high_thresh: f32,
    /// Detections between this and `high_thresh` can only rescue existing tracks.
    pub low_thresh: f32,
    /// Minimum score for an unmatched detection to start a track.
    pub new_track_thresh: f32,
    /// Frames a lost track is kept before removal.
    pub track_buffer: u32,
    /// First-stage cost ceiling (cost = 1 - IoU, or 1 - IoU * score when fused).
    pub match_thresh: f32,
    pub fuse_score: bool,
    /// First-stage raw IoU distance ceiling (BoT-SORT only).
    pub proximity_thresh: Option<f32>,
}

// ----------------------------------------------------------------------------
// Motion model
// ----------------------------------------------------------------------------

/// Constant-velocity box filter with a diagonal covariance.
///
/// State is `[cx, cy, w, h, vx, vy, vw, vh]`.
#[derive(Clone, Debug)]
struct KalmanBoxFilter {
    state: [f32; 8],
    p: [f32; 8],
    q: f32,
    r: f32,
}

impl KalmanBoxFilter {
    fn new(bbox: &BoundingBox) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            state: [cx, cy, bbox.width(), bbox.height(), 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q: 0.1,
            r: 0.5,
        }
    }

    fn predict(&mut self) {
        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }
        for p in &mut self.p {
            *p += self.q;
        }
    }

    fn update(&mut self, bbox: &BoundingBox) {
        let (cx, cy) = bbox.center();
        let residual = [
            cx - self.state[0],
            cy - self.state[1],
            bbox.width() - self.state[2],
            bbox.height() - self.state[3],
        ];
        for i in 0..4 {
            let k = self.p[i] / (self.p[i] + self.r);
            let kv = self.p[i + 4] / (self.p[i + 4] + self.r * 10.0);
            self.state[i] += k * residual[i];
            self.state[i + 4] += kv * residual[i];
            self.p[i] *= 1.0 - k;
            self.p[i + 4] *= 1.0 - kv;
        }
    }

    fn bbox(&self) -> BoundingBox {
        BoundingBox::from_center(
            self.state[0],
            self.state[1],
            self.state[2].max(1.0),
            self.state[3].max(1.0),
        )
    }
}

// ----------------------------------------------------------------------------
// Tracker
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Track {
    id: u32,
    filter: KalmanBoxFilter,
    score: f32,
    class_id: usize,
    frames_lost: u32,
    confirmed: bool,
}

impl Track {
    fn update(&mut self, detection: &Detection) {
        self.filter.update(&detection.bbox);
        self.score = detection.confidence;
        self.class_id = detection.class_id;
        self.frames_lost = 0;
    }

    fn output(&self) -> Detection {
        Detection {
            bbox: self.filter.bbox(),
            confidence: self.score,
            class_id: self.class_id,
            track_id: Some(self.id),
        }
    }
}

pub struct MultiObjectTracker {
    preset: TrackerPreset,
    settings: TrackerSettings,
    tracks: Vec<Track>,
    next_id: u32,
    frame_index: u64,
}

impl MultiObjectTracker {
    pub fn new(preset: TrackerPreset) -> Self {
        Self {
            preset,
            settings: preset.settings(),
            tracks: Vec::new(),
            next_id: 1,
            frame_index: 0,
        }
    }

    pub fn preset(&self) -> TrackerPreset {
        self.preset
    }

    /// Number of live tracks, tentative and lost ones included.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Forget every track and restart identities at 1.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
        self.frame_index = 0;
    }

    /// Associate this frame's detections with existing tracks.
    ///
    /// Returns one detection per confirmed track matched on this frame, carrying
    /// its track id and filtered box.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Detection> {
        self.frame_index += 1;
        let settings = self.settings;

        let was_lost: Vec<bool> = self.tracks.iter().map(|t| t.frames_lost > 0).collect();
        for track in &mut self.tracks {
            track.filter.predict();
        }

        let high: Vec<usize> = (0..detections.len())
            .filter(|&i| detections[i].confidence >= settings.high_thresh)
            .collect();
        let low: Vec<usize> = (0..detections.len())
            .filter(|&i| {
                let c = detections[i].confidence;
                c >= settings.low_thresh && c < settings.high_thresh
            })
            .collect();

        let mut det_used = vec![false; detections.len()];
        let mut track_matched = vec![false; self.tracks.len()];

        // Stage 1: high-score detections against confirmed tracks, lost ones included.
        let confirmed: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| self.tracks[i].confirmed)
            .collect();
        let pairs = self.associate(detections, &high, &confirmed, |iou, score| {
            if let Some(proximity) = settings.proximity_thresh {
                if 1.0 - iou > proximity {
                    return None;
                }
            }
            let cost = if settings.fuse_score {
                1.0 - iou * score
            } else {
                1.0 - iou
            };
            (cost <= settings.match_thresh).then_some(cost)
        });
        self.apply(detections, &pairs, &mut det_used, &mut track_matched);

        // Stage 2: low-score detections rescue confirmed tracks that were live last frame.
        let remaining: Vec<usize> = confirmed
            .iter()
            .copied()
            .filter(|&i| !track_matched[i] && !was_lost[i])
            .collect();
        let pairs = self.associate(detections, &low, &remaining, |iou, _| {
            let cost = 1.0 - iou;
            (cost <= RESCUE_MATCH_THRESH).then_some(cost)
        });
        self.apply(detections, &pairs, &mut det_used, &mut track_matched);

        // Stage 3: leftover high-score detections confirm tentative tracks.
        let leftover: Vec<usize> = high.iter().copied().filter(|&i| !det_used[i]).collect();
        let tentative: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| !self.tracks[i].confirmed)
            .collect();
        let pairs = self.associate(detections, &leftover, &tentative, |iou, _| {
            let cost = 1.0 - iou;
            (cost <= TENTATIVE_MATCH_THRESH).then_some(cost)
        });
        for &(_, track_idx) in &pairs {
            self.tracks[track_idx].confirmed = true;
        }
        self.apply(detections, &pairs, &mut det_used, &mut track_matched);

        let mut output: Vec<Detection> = self
            .tracks
            .iter()
            .zip(&track_matched)
            .filter(|(track, &matched)| matched && track.confirmed)
            .map(|(track, _)| track.output())
            .collect();

        // Unmatched tentative tracks die; unmatched confirmed tracks age.
        let mut kept = Vec::with_capacity(self.tracks.len());
        for (mut track, matched) in self.tracks.drain(..).zip(track_matched) {
            if matched {
                kept.push(track);
            } else if track.confirmed {
                track.frames_lost += 1;
                if track.frames_lost <= settings.track_buffer {
                    kept.push(track);
                }
            }
        }
        self.tracks = kept;

        let first_frame = self.frame_index == 1;
        for &det_idx in &high {
            let detection = &detections[det_idx];
            if det_used[det_idx] || detection.confidence < settings.new_track_thresh {
                continue;
            }
            let track = Track {
                id: self.next_id,
                filter: KalmanBoxFilter::new(&detection.bbox),
                score: detection.confidence,
                class_id: detection.class_id,
                frames_lost: 0,
                confirmed: first_frame,
            };
            self.next_id += 1;
            if first_frame {
                output.push(track.output());
            }
            self.tracks.push(track);
        }

        output
    }

    /// Greedy lowest-cost-first assignment between `dets` and `tracks`.
    fn associate<F>(
        &self,
        detections: &[Detection],
        dets: &[usize],
        tracks: &[usize],
        cost: F,
    ) -> Vec<(usize, usize)>
    where
        F: Fn(f32, f32) -> Option<f32>,
    {
        let mut candidates = Vec::new();
        for &det_idx in dets {
            let detection = &detections[det_idx];
            for &track_idx in tracks {
                let iou = detection.bbox.iou(&self.tracks[track_idx].filter.bbox());
                if let Some(c) = cost(iou, detection.confidence) {
                    candidates.push((c, det_idx, track_idx));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        let mut det_taken = Vec::new();
        let mut track_taken = Vec::new();
        let mut pairs = Vec::new();
        for (_, det_idx, track_idx) in candidates {
            if det_taken.contains(&det_idx) || track_taken.contains(&track_idx) {
                continue;
            }
            det_taken.push(det_idx);
            track_taken.push(track_idx);
            pairs.push((det_idx, track_idx));
        }
        pairs
    }

    fn apply(
        &mut self,
        detections: &[Detection],
        pairs: &[(usize, usize)],
        det_used: &mut [bool],
        track_matched: &mut [bool],
    ) {
        for &(det_idx, track_idx) in pairs {
            self.tracks[track_idx].update(&detections[det_idx]);
            det_used[det_idx] = true;
            track_matched[track_idx] = true;
        }
    }
}
