//! # SortOfRemote NG – Remote Sync host
//!
//! Host-side glue around the sync engine: logging setup and the command
//! surface an RPC layer calls into.

pub mod commands;

pub use sorng_sync::sync::{
  MemoryProfileStore, ProfileStore, SessionStatus, SyncManager, SyncManagerState,
};

/// Install the process-wide subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). `log` records from the
/// engine crates are bridged in. With the `logs-json` feature every line is
/// a JSON object. Calling this twice is harmless.
pub fn init_logging() {
  use tracing_subscriber::EnvFilter;

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

  #[cfg(feature = "logs-json")]
  let result = builder.json().try_init();
  #[cfg(not(feature = "logs-json"))]
  let result = builder.try_init();

  if let Err(e) = result {
    tracing::debug!("logging already initialised: {}", e);
  }
}
