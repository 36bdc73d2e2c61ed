//! tomato_web - browser UI for tomato detection
//!
//! This daemon:
//! 1. Loads configuration and the detection model
//! 2. Serves the single-page UI and its JSON/JPEG endpoints
//! 3. Runs one pipeline session at a time on behalf of the page

use anyhow::Result;
use std::sync::{mpsc, Arc};

use tomato_vision::{
    load_model, AppConfig, AppState, DefaultCaptureBackend, WebConfig, WebServer, YtDlpResolver,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;
    let model = load_model(&config)?;

    let state = Arc::new(AppState::new(
        Arc::new(DefaultCaptureBackend::new()),
        Arc::new(YtDlpResolver::new(config.ytdlp_path.clone())),
        Box::new(model),
    ));
    let handle = WebServer::new(WebConfig::from_app(&config), state).spawn()?;
    log::info!("tomato_web running. open http://{}/", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("tomato_web waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping web server...");
    handle.stop()?;

    Ok(())
}
