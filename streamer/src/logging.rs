//! Logging bootstrap for applications embedding the streamer.
//!
//! Installs a `tracing` subscriber that writes to a log file through a
//! non-blocking appender and mirrors compact output to stdout. The level is
//! taken from `RUST_LOG` and defaults to `info`. The library itself only
//! emits events; calling [`init_logging`] is up to the host application.

use crate::config::LoggingSettings;
use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the file writer alive. Dropping it flushes and closes the log.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initializes logging to `log_dir/log_file` and stdout.
///
/// The log file is truncated at start so each session begins empty.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the file cannot be
/// truncated.
pub fn init_logging(log_dir: &Path, log_file: &str) -> Result<LoggingGuard, io::Error> {
    prepare_log_file(log_dir, log_file)?;

    let appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(false)
        .compact();

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

/// Initializes logging from the `[logging]` config section.
pub fn init_from_settings(settings: &LoggingSettings) -> Result<LoggingGuard, io::Error> {
    init_logging(&settings.directory, &settings.file)
}

/// Creates the log directory and truncates the log file.
fn prepare_log_file(log_dir: &Path, log_file: &str) -> Result<(), io::Error> {
    fs::create_dir_all(log_dir)?;
    fs::write(log_dir.join(log_file), "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_nested_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("deep").join("logs");

        prepare_log_file(&dir, "streamer.log").unwrap();

        assert!(dir.join("streamer.log").exists());
    }

    #[test]
    fn test_prepare_truncates_existing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("streamer.log");
        fs::write(&path, "old session").unwrap();

        prepare_log_file(temp.path(), "streamer.log").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_guard_structure() {
        use tracing_appender::non_blocking::NonBlocking;

        let (writer, guard) = NonBlocking::new(io::sink());
        drop(writer);
        let _guard = LoggingGuard { _file_guard: guard };
    }

    // The global subscriber can only be installed once per process, so
    // init_logging itself is not exercised here.
}
