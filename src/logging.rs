use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::db;

/// Install the global subscriber writing to a daily rolling file.
///
/// Stdout stays free for command output. `RUST_LOG` overrides the configured level.
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(logging: &LoggingConfig) -> Result<WorkerGuard> {
  let directory = match &logging.directory {
    Some(dir) => dir.clone(),
    None => db::data_dir()?.join("logs"),
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&logging.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", logging.level, e))?;

  let appender = tracing_appender::rolling::daily(&directory, "capsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
