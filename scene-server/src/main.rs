//! Hosts one collaborative scene session.
//!
//! Environment:
//! - `SCENE_BIND`         : listen address (default `127.0.0.1:9090`)
//! - `SCENE_SESSION`      : session identifier (default `default`)
//! - `SCENE_STORE_PATH`   : RocksDB directory; unset keeps the scene in memory
//! - `SCENE_AUTOSAVE_SECS`: autosave period in seconds, 0 disables (default 30)
//! - `RUST_LOG`           : log filter (default `info`)

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use scene_sync::session::{SessionConfig, SessionController};
use scene_sync::storage::{MemoryStore, RocksSceneStore, SceneStore, StoreConfig};

fn session_config_from(var: impl Fn(&str) -> Option<String>) -> SessionConfig {
    let mut config = SessionConfig::default();

    if let Some(bind) = var("SCENE_BIND") {
        if bind.trim().is_empty() {
            warn!("Ignoring empty SCENE_BIND");
        } else {
            config.server.bind_addr = bind.trim().to_string();
        }
    }

    if let Some(session) = var("SCENE_SESSION") {
        if session.trim().is_empty() {
            warn!("Ignoring empty SCENE_SESSION");
        } else {
            config.session_id = session.trim().to_string();
        }
    }

    if let Some(raw) = var("SCENE_AUTOSAVE_SECS") {
        match raw.trim().parse::<u64>() {
            Ok(secs) => config.autosave_interval = Duration::from_secs(secs),
            Err(e) => warn!(
                "Ignoring SCENE_AUTOSAVE_SECS={raw:?} ({e}); using {:?}",
                config.autosave_interval
            ),
        }
    }

    config
}

fn open_store(path: Option<String>) -> Result<Arc<dyn SceneStore>, String> {
    match path {
        Some(path) => RocksSceneStore::open(StoreConfig::new(path))
            .map(|store| Arc::new(store) as Arc<dyn SceneStore>)
            .map_err(|e| e.to_string()),
        None => {
            warn!("SCENE_STORE_PATH not set; the scene is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = session_config_from(|key| env::var(key).ok());
    info!(
        "Starting scene server: session {} on {}",
        config.session_id, config.server.bind_addr
    );

    let store = match open_store(env::var("SCENE_STORE_PATH").ok()) {
        Ok(store) => store,
        Err(e) => {
            error!("Cannot open scene store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match SessionController::new(config, store).run(shutdown_signal()).await {
        Ok(()) => {
            info!("Scene server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Scene server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
