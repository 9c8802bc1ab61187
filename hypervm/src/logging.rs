//! Process-wide log setup.

use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// With a log directory, output goes to a daily-rotated file under it;
/// otherwise to stderr. `debug` lowers the default filter; `RUST_LOG`
/// overrides either way. Returns a guard that must be held for the life of
/// the process when file logging is active.
pub fn init_logging(
    debug: bool,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hypervm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
