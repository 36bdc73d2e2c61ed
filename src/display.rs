//! Display sinks.
//!
//! A sink is the one on-screen region processed frames go to. Every `show`
//! replaces what was there; nothing is queued. Sinks also carry the short
//! sidebar-style notices the pipeline emits (info, success, error).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::frame::{ChannelOrder, Frame};

const JPEG_QUALITY: u8 = 80;
const MAX_NOTICES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Where annotated frames and notices go.
pub trait DisplaySink: Send + Sync {
    /// Replace the displayed image. `channels` says how `frame`'s bytes are ordered.
    fn show(&self, frame: &Frame, caption: &str, channels: ChannelOrder) -> Result<()>;

    fn notify(&self, notice: Notice);
}

// ----------------------------------------------------------------------------
// Shared overwrite slot (web UI)
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    jpeg: Option<Arc<Vec<u8>>>,
    caption: String,
    seq: u64,
    frames: u64,
    running: bool,
    session: u64,
    notices: VecDeque<Notice>,
}

/// Point-in-time view of a `DisplaySlot`, served as `/status`.
#[derive(Clone, Debug, Serialize)]
pub struct SlotSnapshot {
    pub seq: u64,
    pub caption: String,
    pub running: bool,
    pub frames: u64,
    pub notices: Vec<Notice>,
}

/// Single image slot shared between a pipeline session and HTTP readers.
///
/// Cloning shares the slot. `show` encodes to JPEG once so readers only copy
/// an `Arc`.
#[derive(Clone, Default)]
pub struct DisplaySlot {
    inner: Arc<Mutex<SlotState>>,
}

impl DisplaySlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a new session as running and clear the previous session's notices
    /// and frame count. The last image stays until the new session replaces it.
    ///
    /// Returns the id `end_session` must be given.
    pub fn begin_session(&self) -> u64 {
        let mut state = self.lock();
        state.session += 1;
        state.running = true;
        state.frames = 0;
        state.notices.clear();
        state.session
    }

    /// Mark session `id` finished. A no-op once a newer session has begun.
    pub fn end_session(&self, id: u64) {
        let mut state = self.lock();
        if state.session == id {
            state.running = false;
        }
    }

    /// Latest JPEG and its sequence number.
    pub fn latest_jpeg(&self) -> Option<(Arc<Vec<u8>>, u64)> {
        let state = self.lock();
        state.jpeg.as_ref().map(|jpeg| (Arc::clone(jpeg), state.seq))
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let state = self.lock();
        SlotSnapshot {
            seq: state.seq,
            caption: state.caption.clone(),
            running: state.running,
            frames: state.frames,
            notices: state.notices.iter().cloned().collect(),
        }
    }
}

impl DisplaySink for DisplaySlot {
    fn show(&self, frame: &Frame, caption: &str, channels: ChannelOrder) -> Result<()> {
        let jpeg = frame.encode_jpeg(channels, JPEG_QUALITY)?;
        let mut state = self.lock();
        state.jpeg = Some(Arc::new(jpeg));
        state.caption = caption.to_string();
        state.seq += 1;
        state.frames += 1;
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        let mut state = self.lock();
        if state.notices.len() == MAX_NOTICES {
            state.notices.pop_front();
        }
        state.notices.push_back(notice);
    }
}

// ----------------------------------------------------------------------------
// File sink (CLI)
// ----------------------------------------------------------------------------

/// Writes each shown frame over one image file and logs notices.
///
/// Without a path it only counts frames.
pub struct FileSink {
    path: Option<PathBuf>,
    frames: AtomicU64,
    notices: Mutex<Vec<Notice>>,
}

impl FileSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            frames: AtomicU64::new(0),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|notices| notices.clone())
            .unwrap_or_default()
    }
}

impl DisplaySink for FileSink {
    fn show(&self, frame: &Frame, caption: &str, channels: ChannelOrder) -> Result<()> {
        if let Some(path) = &self.path {
            frame
                .clone()
                .reinterpret(channels)
                .to_rgb_image()?
                .save(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("FileSink: {} #{}", caption, count);
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info | NoticeLevel::Success => log::info!("{}", notice.message),
            NoticeLevel::Error => log::error!("{}", notice.message),
        }
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}

/// Decode a JPEG served from a slot (tests and tooling).
pub fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < 2 || bytes[..2] != [0xFF, 0xD8] {
        return Err(anyhow!("not a JPEG stream"));
    }
    Frame::decode(bytes)
}
