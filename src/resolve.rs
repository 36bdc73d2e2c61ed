//! Remote video URL resolution.
//!
//! A YouTube page URL is not something a decoder can open; `yt-dlp` turns it
//! into a direct media URL for the best single-file MP4 format.

use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::ingest::STUB_SCHEME;

/// Turns a page URL into a stream URL a capture backend can open.
pub trait UrlResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Result<String>;
}

/// Format selector for the best progressive MP4 stream.
pub const YTDLP_FORMAT: &str = "best[ext=mp4]";

/// Resolves URLs by running the `yt-dlp` binary.
///
/// `stub://` URLs are returned unchanged so offline sessions never spawn it.
#[derive(Clone, Debug)]
pub struct YtDlpResolver {
    binary: String,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl UrlResolver for YtDlpResolver {
    fn resolve(&self, url: &str) -> Result<String> {
        if url.starts_with(STUB_SCHEME) {
            return Ok(url.to_string());
        }

        log::info!("YtDlpResolver: resolving {}", url);
        let output = Command::new(&self.binary)
            .args(["--no-warnings", "--quiet", "--no-playlist", "-f", YTDLP_FORMAT])
            .arg("--get-url")
            .arg(url)
            .output()
            .with_context(|| format!("failed to run {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8(output.stdout).context("yt-dlp printed non-UTF-8 output")?;
        let resolved = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("{} returned no stream URL for {}", self.binary, url))?;
        log::debug!("YtDlpResolver: {} -> {}", url, resolved);
        Ok(resolved.to_string())
    }
}
