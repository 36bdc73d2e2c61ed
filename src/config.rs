use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_MODEL_PATH: &str = "weights/tmto_model.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CLASS_NAME: &str = "tomato";
const DEFAULT_WEBCAM_INDEX: u32 = 0;
const DEFAULT_WEB_ADDR: &str = "127.0.0.1:8501";
const DEFAULT_UPLOAD_LIMIT: u64 = 200 * 1024 * 1024;
const DEFAULT_CONFIDENCE: f32 = 0.40;
const DEFAULT_YTDLP_PATH: &str = "yt-dlp";
const DEFAULT_IMAGE_DIR: &str = "images";
const DEFAULT_IMAGE_NAME: &str = "IMG_1022.jpg";
const DEFAULT_VIDEO_DIR: &str = "videos";

#[derive(Debug, Deserialize, Default)]
struct TomatoConfigFile {
    model: Option<ModelConfigFile>,
    capture: Option<CaptureConfigFile>,
    web: Option<WebConfigFile>,
    detection: Option<DetectionConfigFile>,
    youtube: Option<YoutubeConfigFile>,
    media: Option<MediaConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<PathBuf>,
    backend: Option<BackendKind>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    webcam_index: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct WebConfigFile {
    addr: Option<String>,
    upload_limit_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct YoutubeConfigFile {
    ytdlp_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MediaConfigFile {
    image_dir: Option<PathBuf>,
    default_image: Option<PathBuf>,
    videos: Option<BTreeMap<String, PathBuf>>,
}

/// Which detector backend `load_model` builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Color segmentation, no model file needed.
    Color,
    /// YOLOv8 ONNX through tract (feature: backend-tract).
    Tract,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "backend-tract") {
            BackendKind::Tract
        } else {
            BackendKind::Color
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "color" => Ok(BackendKind::Color),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!("unknown backend '{}' (expected color or tract)", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Color => "color",
            BackendKind::Tract => "tract",
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model_path: PathBuf,
    pub backend: BackendKind,
    pub input_size: u32,
    pub class_names: Vec<String>,
    pub webcam_index: u32,
    pub web_addr: String,
    pub upload_limit: u64,
    /// Default confidence threshold, in (0, 1].
    pub confidence: f32,
    pub ytdlp_path: String,
    pub image_dir: PathBuf,
    pub default_image: PathBuf,
    /// Stored videos by name.
    pub videos: BTreeMap<String, PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(TomatoConfigFile::default())
    }
}

impl AppConfig {
    /// Defaults, then the file named by `TOMATO_CONFIG`, then `TOMATO_*` env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TOMATO_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TomatoConfigFile) -> Self {
        let model = file.model.unwrap_or_default();
        let media = file.media.unwrap_or_default();
        let web = file.web.unwrap_or_default();

        let image_dir = media
            .image_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR));
        let default_image = media
            .default_image
            .unwrap_or_else(|| image_dir.join(DEFAULT_IMAGE_NAME));
        let videos = media.videos.unwrap_or_else(|| {
            BTreeMap::from([(
                "video_1".to_string(),
                Path::new(DEFAULT_VIDEO_DIR).join("vedio.mp4"),
            )])
        });

        Self {
            model_path: model
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            backend: model.backend.unwrap_or_default(),
            input_size: model.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            class_names: model
                .class_names
                .unwrap_or_else(|| vec![DEFAULT_CLASS_NAME.to_string()]),
            webcam_index: file
                .capture
                .and_then(|capture| capture.webcam_index)
                .unwrap_or(DEFAULT_WEBCAM_INDEX),
            web_addr: web.addr.unwrap_or_else(|| DEFAULT_WEB_ADDR.to_string()),
            upload_limit: web.upload_limit_bytes.unwrap_or(DEFAULT_UPLOAD_LIMIT),
            confidence: file
                .detection
                .and_then(|detection| detection.confidence)
                .unwrap_or(DEFAULT_CONFIDENCE),
            ytdlp_path: file
                .youtube
                .and_then(|youtube| youtube.ytdlp_path)
                .unwrap_or_else(|| DEFAULT_YTDLP_PATH.to_string()),
            image_dir,
            default_image,
            videos,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("TOMATO_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model_path = PathBuf::from(path);
            }
        }
        if let Ok(backend) = std::env::var("TOMATO_BACKEND") {
            if !backend.trim().is_empty() {
                self.backend = backend.parse()?;
            }
        }
        if let Ok(names) = std::env::var("TOMATO_CLASS_NAMES") {
            let parsed = split_csv(&names);
            if !parsed.is_empty() {
                self.class_names = parsed;
            }
        }
        if let Ok(index) = std::env::var("TOMATO_WEBCAM_INDEX") {
            self.webcam_index = index
                .trim()
                .parse()
                .map_err(|_| anyhow!("TOMATO_WEBCAM_INDEX must be a non-negative integer"))?;
        }
        if let Ok(addr) = std::env::var("TOMATO_WEB_ADDR") {
            if !addr.trim().is_empty() {
                self.web_addr = addr;
            }
        }
        if let Ok(confidence) = std::env::var("TOMATO_CONFIDENCE") {
            self.confidence = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("TOMATO_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(path) = std::env::var("TOMATO_YTDLP_PATH") {
            if !path.trim().is_empty() {
                self.ytdlp_path = path;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(self.confidence > 0.0 && self.confidence <= 1.0) {
            return Err(anyhow!(
                "confidence must be in (0, 1], got {}",
                self.confidence
            ));
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(anyhow!(
                "model input size must be a positive multiple of 32, got {}",
                self.input_size
            ));
        }
        if self.class_names.is_empty() {
            return Err(anyhow!("at least one class name is required"));
        }
        if self.upload_limit == 0 {
            return Err(anyhow!("upload limit must be greater than zero"));
        }
        self.web_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid web address '{}'", self.web_addr))?;
        if self.videos.keys().any(|name| name.trim().is_empty()) {
            return Err(anyhow!("stored video names must not be empty"));
        }
        Ok(())
    }

    /// Path of a stored video by name.
    pub fn stored_video(&self, name: &str) -> Result<&Path> {
        self.videos.get(name).map(PathBuf::as_path).ok_or_else(|| {
            anyhow!(
                "no stored video named '{}' (known: {})",
                name,
                self.videos.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }
}

fn read_config_file(path: &Path) -> Result<TomatoConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
