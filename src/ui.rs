use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::display::{DisplaySink, Notice, NoticeLevel};
use crate::frame::{ChannelOrder, Frame};

/// How `tomato_detect` reports progress on stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = spinner("{spinner} {msg}");
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Wrap `sink` so every shown frame advances a frame counter.
    pub fn frame_progress<'a>(&self, label: &str, sink: &'a dyn DisplaySink) -> ProgressSink<'a> {
        let bar = self.use_pretty().then(|| {
            let bar = spinner("{spinner} {msg} [{pos} frames, {per_sec}]");
            bar.set_message(label.to_string());
            bar
        });
        if bar.is_none() {
            eprintln!("==> {}", label);
        }
        ProgressSink {
            inner: sink,
            bar,
            label: label.to_string(),
            start: Instant::now(),
        }
    }
}

fn spinner(template: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let style =
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// Display sink decorator that counts frames on a spinner.
///
/// Notices go to the spinner line (pretty) or stderr (plain) before being
/// forwarded.
pub struct ProgressSink<'a> {
    inner: &'a dyn DisplaySink,
    bar: Option<ProgressBar>,
    label: String,
    start: Instant,
}

impl ProgressSink<'_> {
    pub fn finish(&self, ok: bool, summary: &str) {
        let message = format!(
            "{} {}: {} ({})",
            if ok { "✔" } else { "✘" },
            self.label,
            summary,
            format_duration(self.start.elapsed())
        );
        match &self.bar {
            Some(bar) => bar.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

impl DisplaySink for ProgressSink<'_> {
    fn show(&self, frame: &Frame, caption: &str, channels: ChannelOrder) -> anyhow::Result<()> {
        self.inner.show(frame, caption, channels)?;
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        let prefix = match notice.level {
            NoticeLevel::Info => "…",
            NoticeLevel::Success => "✔",
            NoticeLevel::Error => "✘",
        };
        match &self.bar {
            Some(bar) => bar.println(format!("{} {}", prefix, notice.message)),
            None => eprintln!("{} {}", prefix, notice.message),
        }
        self.inner.notify(notice);
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
