//! tomato_detect - run the tomato detection pipeline from the terminal
//!
//! Opens exactly one source, runs the frame loop until the source ends or
//! Ctrl-C is pressed, and writes the latest annotated frame to `--out`.

use anyhow::{anyhow, Result};
use clap::{ArgGroup, Parser};
use std::io::IsTerminal;
use std::path::PathBuf;

use tomato_vision::{
    detect_image, load_model, run_source, ui, AppConfig, CancelToken, DefaultCaptureBackend,
    FileSink, InferenceMode, Outcome, PipelineConfig, TrackerPreset, VideoSource, YtDlpResolver,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(group(
    ArgGroup::new("source")
        .required(true)
        .args(["webcam", "rtsp", "youtube", "video", "stored", "image"])
))]
struct Args {
    /// Webcam device index (defaults to the configured index).
    #[arg(long, value_name = "INDEX", num_args = 0..=1)]
    webcam: Option<Option<u32>>,
    /// RTSP stream URL.
    #[arg(long, value_name = "URL")]
    rtsp: Option<String>,
    /// YouTube video URL.
    #[arg(long, value_name = "URL")]
    youtube: Option<String>,
    /// Local video file.
    #[arg(long, value_name = "PATH")]
    video: Option<PathBuf>,
    /// Name of a configured stored video.
    #[arg(long, value_name = "NAME")]
    stored: Option<String>,
    /// Still image (empty value uses the configured default image).
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    image: Option<Option<PathBuf>>,
    /// Track objects across frames with the given preset (bytetrack.yaml, botsort.yaml).
    #[arg(long, value_name = "PRESET", value_parser = parse_tracker)]
    tracker: Option<TrackerPreset>,
    /// Confidence threshold in percent.
    #[arg(long, value_name = "PERCENT", value_parser = clap::value_parser!(u8).range(25..=100))]
    conf: Option<u8>,
    /// Write the latest annotated frame here (png or jpg).
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

fn parse_tracker(raw: &str) -> std::result::Result<TrackerPreset, String> {
    raw.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(args.ui, is_tty, !stdout_is_tty);

    let config = AppConfig::load()?;
    let mode = InferenceMode::from_tracker(args.tracker);
    let pipeline = match args.conf {
        Some(percent) => PipelineConfig::from_percent(percent, mode)?,
        None => PipelineConfig::new(config.confidence, mode)?,
    };

    let mut model = {
        let _stage = ui.stage("Loading model");
        load_model(&config)?
    };
    let sink = FileSink::new(args.out.clone());

    if let Some(image) = &args.image {
        let path = image.clone().unwrap_or_else(|| config.default_image.clone());
        let progress = ui.frame_progress(&format!("image {}", path.display()), &sink);
        let result = detect_image(&path, pipeline.confidence(), &mut model, &progress);
        return match result {
            Ok(result) => {
                progress.finish(true, &format!("{} detections", result.detections.len()));
                for detection in &result.detections {
                    let b = &detection.bbox;
                    println!(
                        "{} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}]",
                        result.class_name(detection.class_id),
                        detection.confidence,
                        b.x1,
                        b.y1,
                        b.x2,
                        b.y2
                    );
                }
                Ok(())
            }
            Err(err) => {
                progress.finish(false, err.kind());
                Err(err.into())
            }
        };
    }

    let source = if let Some(index) = args.webcam {
        VideoSource::Device(index.unwrap_or(config.webcam_index))
    } else if let Some(url) = args.rtsp {
        VideoSource::Stream(url)
    } else if let Some(url) = args.youtube {
        VideoSource::Remote(url)
    } else if let Some(path) = args.video {
        VideoSource::Local(path)
    } else if let Some(name) = args.stored {
        VideoSource::Local(config.stored_video(&name)?.to_path_buf())
    } else {
        return Err(anyhow!("no source selected"));
    };

    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || handler_cancel.cancel())?;

    let progress = ui.frame_progress(&source.to_string(), &sink);
    let report = run_source(
        &pipeline,
        &source,
        &DefaultCaptureBackend::new(),
        &YtDlpResolver::new(config.ytdlp_path.clone()),
        &mut model,
        &progress,
        &cancel,
    );
    match report.outcome {
        Outcome::Completed => {
            progress.finish(true, &format!("{} frames", report.frames));
            Ok(())
        }
        Outcome::Cancelled => {
            progress.finish(true, &format!("stopped after {} frames", report.frames));
            Ok(())
        }
        Outcome::Failed(err) => {
            progress.finish(false, err.kind());
            Err(err.into())
        }
    }
}
