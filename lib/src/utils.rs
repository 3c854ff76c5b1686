use serde::{de::DeserializeOwned, Serialize};
use std::{error::Error, path::Path};

#[cfg(not(debug_assertions))]
use human_panic::setup_panic;
use tracing::subscriber::{DefaultGuard, SetGlobalDefaultError};

#[cfg(debug_assertions)]
extern crate better_panic;

// [NOTE] tracing
//
// Library code logs with the `tracing` macros (trace, debug, info, warn) and wraps the
// passes in `#[tracing::instrument]` spans. Nothing is printed until a subscriber is
// installed: the binary installs the global one below, tests a scoped one.

pub fn install_logger() -> Result<(), SetGlobalDefaultError> {
  let subscriber = tracing_subscriber::fmt().compact();

  #[cfg(debug_assertions)]
  let subscriber = subscriber.with_max_level(tracing::Level::DEBUG);

  let subscriber = subscriber.finish();
  tracing::subscriber::set_global_default(subscriber)
}

pub fn init_logging() -> Result<(), SetGlobalDefaultError> {
  // Human Panic. Only enabled when *not* debugging.
  #[cfg(not(debug_assertions))]
  {
    setup_panic!();
  }

  // Better Panic. Only enabled *when* debugging.
  #[cfg(debug_assertions)]
  {
    better_panic::Settings::debug()
      .most_recent_first(false)
      .lineno_suffix(true)
      .verbosity(better_panic::Verbosity::Full)
      .install();
  }

  // Setup Logging
  install_logger()?;

  Ok(())
}

/// Subscriber for the current thread only, dropped with the guard. Output goes through the
/// test harness so it is only shown for failing tests.
pub fn init_logging_tests() -> DefaultGuard {
  let subscriber = tracing_subscriber::fmt()
    .compact()
    .with_max_level(tracing::Level::TRACE)
    .with_test_writer()
    .finish();
  tracing::subscriber::set_default(subscriber)
}

pub fn serialize_to_file<T: Serialize>(path: &Path, obj: &T) -> Result<(), Box<dyn Error>> {
  let buff = serde_json::to_string_pretty(obj)?;
  std::fs::write(path, buff)
    .map_err(|e| format!("Error creating file {}: {}", path.display(), e))?;
  Ok(())
}

pub fn deserialize_from_file<T: DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
  let buff = std::fs::read_to_string(path)
    .map_err(|e| format!("Error reading file {}: {}", path.display(), e))?;
  Ok(serde_json::from_str(&buff)?)
}
