//! RFB-TV client - main entry point.
//!
//! Loads the JSON configuration, wires a session with stub embedder
//! callbacks and runs it until interrupted.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info};
use rfbtv_core::config::Config;
use rfbtv_core::session::{KeyMap, Session, SessionContext, SessionObserver};
use rfbtv_core::{ClientErrorCode, SessionState};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct LoggingObserver {
    disconnected: Arc<AtomicBool>,
}

impl SessionObserver for LoggingObserver {
    fn state_changed(&self, state: SessionState, error_code: ClientErrorCode) {
        info!("Session state: {:?} ({:?})", state, error_code);
        if matches!(state, SessionState::Disconnected | SessionState::Error) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            error!("{}", error);
            std::process::exit(1);
        }
    };

    // Command line overrides
    if let Some(url) = args.session_url {
        config.session_manager_url = url;
    }
    if let Some(url) = args.app_url {
        config.rfbtv.app_url = url;
    }
    if let Some(resolution) = args.resolution {
        config.rfbtv.resolution = resolution;
    }
    if let Some(path) = args.base_store_path {
        config.base_store_path = path;
    }

    let (width, height) = match config.resolution() {
        Ok(resolution) => resolution,
        Err(error) => {
            error!("{}", error);
            std::process::exit(1);
        }
    };

    let context = SessionContext {
        client_manufacturer: config.rfbtv.client_manufacturer.clone(),
        client_model: config.rfbtv.client_model.clone(),
        unique_id: config.unique_id(),
        base_store_path: config.base_store_path.clone(),
        stream_forward_url: config.rfbtv.stream_forward_url.clone(),
        key_map: KeyMap::default(),
        preferred_language: String::new(),
    };

    let disconnected = Arc::new(AtomicBool::new(false));
    let observer = Arc::new(LoggingObserver {
        disconnected: disconnected.clone(),
    });

    let session = Session::new(context, observer);

    info!(
        "Connecting to {} ({}x{})",
        config.session_manager_url, width, height
    );

    let mut parameters = BTreeMap::new();
    for (key, value) in &config.rfbtv.setup_params {
        parameters.insert(key.clone(), value.clone());
    }

    session.initiate(
        &config.session_manager_url,
        &config.rfbtv.app_url,
        width,
        height,
        &parameters,
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc_handler(move || interrupted.store(true, Ordering::SeqCst));
    }

    while !interrupted.load(Ordering::SeqCst) && !disconnected.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down");
    session.terminate();
    std::thread::sleep(Duration::from_millis(200));
}

/// Minimal SIGINT hook without an extra dependency.
fn ctrlc_handler(handler: impl Fn() + Send + 'static) {
    // A detached thread watching for EOF on stdin doubles as a portable
    // interrupt in headless runs; SIGINT terminates the process anyway.
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = std::io::stdin().read_line(&mut buf);
        handler();
    });
}
