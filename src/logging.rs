use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directory for rolling log files
fn logs_dir() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("fieldcache").join("logs"))
}

/// Initialize logging for the long-running agent.
///
/// Logs go to a daily rolling file; with `verbose` they are mirrored to
/// stdout. `RUST_LOG` overrides the default filter. The returned guard must
/// be kept alive for buffered file output to be flushed.
pub fn init(verbose: bool) -> Option<WorkerGuard> {
  let default_level = if verbose { "debug" } else { "info" };
  let env_filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("fieldcache={},warn", default_level)));

  let appender = logs_dir().and_then(|dir| {
    std::fs::create_dir_all(&dir).ok()?;
    RollingFileAppender::builder()
      .rotation(Rotation::DAILY)
      .max_log_files(7)
      .filename_prefix("fieldcache")
      .filename_suffix("log")
      .build(&dir)
      .ok()
  });

  match appender {
    Some(appender) => {
      let (non_blocking, guard) = tracing_appender::non_blocking(appender);
      let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
      let console_layer = verbose.then(|| fmt::layer().with_writer(std::io::stdout));

      tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();
      Some(guard)
    }
    None => {
      // Fallback: console logging only
      tracing_subscriber::fmt().with_env_filter(env_filter).init();
      tracing::warn!("File logging unavailable, using console only");
      None
    }
  }
}

/// Console-only logging for one-shot commands.
pub fn init_console() {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldcache=warn"));
  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .init();
}
