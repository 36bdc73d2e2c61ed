//! Synthetic capture for `stub://` targets.
//!
//! Generates BGR frames of a green field with a red disc drifting left to right,
//! which is enough for the color backend to find and the tracker to follow.
//!
//! Query parameters:
//! - `frames=N`   end of stream after N frames (default: endless)
//! - `width=W`, `height=H` frame size (default 640x480)
//! - `fail_at=K`  the K-th read (1-based) fails with a decode error
//! - `closed=1`   the handle opens but reports itself closed

use anyhow::{anyhow, Context, Result};

use super::{VideoCapture, STUB_SCHEME};
use crate::frame::{ChannelOrder, Frame};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const BACKGROUND_BGR: [u8; 3] = [40, 140, 60];
const TOMATO_BGR: [u8; 3] = [30, 30, 220];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub fail_at: Option<u64>,
    pub closed: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            frames: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fail_at: None,
            closed: false,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(spec: &str) -> Result<Self> {
        let rest = spec
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| anyhow!("'{}' is not a {} target", spec, STUB_SCHEME))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut config = Self {
            name: name.to_string(),
            ..Self::default()
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "frames" => config.frames = Some(parse_number(&key, &value)?),
                "width" => config.width = parse_number(&key, &value)?,
                "height" => config.height = parse_number(&key, &value)?,
                "fail_at" => config.fail_at = Some(parse_number(&key, &value)?),
                "closed" => config.closed = value == "1" || value == "true",
                other => log::warn!("SyntheticCapture: ignoring unknown parameter '{}'", other),
            }
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero"));
        }
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("stub parameter {}='{}' is not a number", key, value))
}

pub struct SyntheticCapture {
    config: SyntheticConfig,
    frame_count: u64,
    open: bool,
}

impl SyntheticCapture {
    pub fn open(config: SyntheticConfig) -> Self {
        let open = !config.closed;
        log::info!(
            "SyntheticCapture: opened {} ({}x{}, open={})",
            config.name,
            config.width,
            config.height,
            open
        );
        Self {
            config,
            frame_count: 0,
            open,
        }
    }

    fn render(&self) -> Result<Frame> {
        let SyntheticConfig { width, height, .. } = self.config;
        let mut data = Frame::filled(width, height, ChannelOrder::Bgr, BACKGROUND_BGR).into_bytes();

        let radius = (height / 8).max(2) as i64;
        let cx = ((self.frame_count * 8) % width as u64) as i64;
        let cy = (height / 2) as i64;
        for y in (cy - radius).max(0)..(cy + radius + 1).min(height as i64) {
            for x in (cx - radius).max(0)..(cx + radius + 1).min(width as i64) {
                let (dx, dy) = (x - cx, y - cy);
                if dx * dx + dy * dy <= radius * radius {
                    let idx = (y as usize * width as usize + x as usize) * 3;
                    data[idx..idx + 3].copy_from_slice(&TOMATO_BGR);
                }
            }
        }
        Frame::new(data, width, height, ChannelOrder::Bgr)
    }
}

impl VideoCapture for SyntheticCapture {
    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Ok(None);
        }
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        if self.config.fail_at == Some(self.frame_count) {
            return Err(anyhow!(
                "synthetic decode failure at frame {} of {}",
                self.frame_count,
                self.config.name
            ));
        }
        self.render().map(Some)
    }

    fn release(&mut self) {
        if self.open {
            log::info!(
                "SyntheticCapture: released {} after {} frames",
                self.config.name,
                self.frame_count
            );
        }
        self.open = false;
    }
}
