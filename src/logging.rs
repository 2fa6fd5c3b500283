//! Tracing subscriber setup.

use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Environment variable overriding the configured filter.
pub const LOG_ENV: &str = "OUTPOST_LOG";

/// Install the global subscriber.
///
/// Logs go to a daily file when enabled, and to stderr when `verbose` is
/// non-zero (one `-v` for debug, two or more for trace). The returned guard
/// flushes the file writer on drop and must be held until exit.
pub fn init(config: &LogConfig, verbose: u8) -> Result<Option<WorkerGuard>> {
  let filter = || {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.level))
  };

  let (file_layer, guard) = if config.file {
    let dir = log_dir(config)?;
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

    let appender = tracing_appender::rolling::daily(&dir, "outpost.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
      .with_writer(writer)
      .with_ansi(false)
      .with_filter(filter());
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  let stderr_layer = (verbose > 0).then(|| {
    let level = match verbose {
      1 => "debug",
      _ => "trace",
    };
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .with_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level)))
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

fn log_dir(config: &LogConfig) -> Result<PathBuf> {
  if let Some(dir) = &config.dir {
    return Ok(dir.clone());
  }
  dirs::state_dir()
    .or_else(dirs::data_dir)
    .map(|dir| dir.join("outpost"))
    .ok_or_else(|| eyre!("Could not determine a log directory; set log.dir"))
}
