use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "offline_agent=info";

/// Install the global subscriber. Logs go to stderr, or to `log_file` when given.
///
/// The returned guard flushes buffered lines on drop; keep it alive until exit.
pub fn init(log_file: Option<&Path>) -> Result<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let (writer, guard) = match log_file {
    Some(path) => {
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
      };
      tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name))
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(log_file.is_none())
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
