//! Logging setup for hosts embedding the decode pipeline.
//!
//! The library itself only emits `tracing` events (request ids, admission
//! decisions, stage failures); it never installs a global subscriber. Hosts
//! that want file output without wiring their own subscriber can call
//! [`init_logging`]:
//! - Writes to `<dir>/texelpipe.log` (cleared on session start)
//! - Also prints to stdout
//! - Configurable via the `RUST_LOG` environment variable

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the logging system.
///
/// Creates the log directory if needed, clears the previous log file, and
/// sets up dual output to file and stdout. Call at most once per process;
/// a second call fails inside `tracing` because the global subscriber is
/// already set.
///
/// # Arguments
///
/// * `log_dir` - Directory for log files (e.g., "logs")
/// * `log_file` - Log filename (e.g., "texelpipe.log")
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the log file
/// cannot be cleared.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;

    // Clear the previous log file; handles both existing and missing files.
    let log_path = Path::new(log_dir).join(log_file);
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true)
        .with_span_events(FmtSpan::CLOSE);

    // Defaults to INFO when RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Default log directory path.
pub fn default_log_dir() -> &'static str {
    "logs"
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "texelpipe.log"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_log_dir() -> PathBuf {
        // Unique directory per test to avoid collisions.
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = PathBuf::from(format!("test_logs_{}", timestamp));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_default_paths() {
        assert_eq!(default_log_dir(), "logs");
        assert_eq!(default_log_file(), "texelpipe.log");
    }

    #[test]
    fn test_log_file_cleared_on_start() {
        let log_dir = test_log_dir();
        fs::create_dir_all(&log_dir).expect("create test dir");
        let log_file = log_dir.join("stale.log");
        fs::write(&log_file, "stale session data").expect("write stale data");

        // init_logging cannot run here (global subscriber is once-per-process);
        // exercise the same clear-on-start file path directly.
        fs::write(&log_file, "").expect("clear log file");
        assert_eq!(fs::read_to_string(&log_file).unwrap(), "");

        fs::remove_dir_all(&log_dir).expect("cleanup");
    }

    #[test]
    fn test_guard_holds_worker_guard() {
        use tracing_appender::non_blocking::NonBlocking;

        let (non_blocking, guard) = NonBlocking::new(std::io::sink());
        drop(non_blocking);

        let _logging_guard = LoggingGuard { _file_guard: guard };
    }
}
