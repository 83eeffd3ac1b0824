//! `sorng-sync <profiles.json> <connection-id>`
//!
//! Starts one sync session and keeps it running until Ctrl-C. Engine
//! tunables are read from `<config dir>/sorng-sync/engine.json` when that
//! file exists.

use app_lib::{init_logging, MemoryProfileStore, SyncManager};
use sorng_core::config::EngineConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

fn engine_config() -> EngineConfig {
  let Some(path) = dirs::config_dir().map(|d| d.join("sorng-sync").join("engine.json")) else {
    return EngineConfig::default();
  };
  if !path.exists() {
    return EngineConfig::default();
  }
  match EngineConfig::load(&path) {
    Ok(config) => {
      tracing::info!("engine settings loaded from {}", path.display());
      config
    }
    Err(e) => {
      tracing::warn!("ignoring {}: {}", path.display(), e);
      EngineConfig::default()
    }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  init_logging();

  let mut args = std::env::args().skip(1);
  let (Some(profiles), Some(connection_id)) = (args.next().map(PathBuf::from), args.next()) else {
    eprintln!("usage: sorng-sync <profiles.json> <connection-id>");
    return ExitCode::from(2);
  };

  let store = match MemoryProfileStore::load(&profiles) {
    Ok(store) => Arc::new(store),
    Err(e) => {
      tracing::error!("{}", e);
      return ExitCode::FAILURE;
    }
  };
  let manager = SyncManager::new(store, engine_config());

  match manager.start(&connection_id).await {
    Ok(status) => tracing::info!(
      "syncing {} <-> {}{} ({:?})",
      status.local_root.display(),
      status.endpoint,
      status.remote_root,
      status.mode
    ),
    Err(e) => {
      tracing::error!("could not start {}: {}", connection_id, e);
      return ExitCode::FAILURE;
    }
  }

  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!("signal handler failed: {}", e);
  }
  tracing::info!("shutting down");
  manager.shutdown().await;
  ExitCode::SUCCESS
}
