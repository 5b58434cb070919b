//! Tracing setup for the relay
//!
//! Console output follows the operator's chosen level while a full trace of
//! the last run is kept on disk. Transcoder diagnostics are re-emitted through
//! this subscriber, so the file log is the complete record of a failed run.

use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File holding the trace of the most recent run
pub const LAST_RUN_LOG: &str = "framerelay-last-run.log";

/// Directives for the file layer: everything from this workspace, only
/// notable events from the runtime and other dependencies.
const FILE_DIRECTIVES: &str = "info,framerelay_core=trace,framerelay=trace";

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot create log directory {path}: {source}")]
    LogDirectory { path: PathBuf, source: io::Error },

    #[error("Cannot open log file {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },

    #[error("Global subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Installs the global subscriber: console at `console_level` (or
/// `RUST_LOG` when set) plus a trace file under `logs_dir`, `./logs` by
/// default. The file is truncated on every start.
///
/// # Errors
///
/// - `TracingError::LogDirectory` - Log directory could not be created
/// - `TracingError::LogFile` - Log file could not be opened for writing
/// - `TracingError::AlreadyInstalled` - Another subscriber owns the process
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<(), TracingError> {
    let log_file_path = last_run_log_path(logs_dir);
    let logs_path = log_file_path.parent().unwrap_or_else(|| Path::new("."));
    create_dir_all(logs_path).map_err(|source| TracingError::LogDirectory {
        path: logs_path.to_path_buf(),
        source,
    })?;
    let log_file = File::create(&log_file_path).map_err(|source| TracingError::LogFile {
        path: log_file_path.clone(),
        source,
    })?;

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_filter(console_filter(console_level));

    let file_layer = fmt::layer()
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(FILE_DIRECTIVES));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        console = %console_level,
        trace_file = %log_file_path.display(),
        "Tracing initialized"
    );
    Ok(())
}

/// Location of the last-run trace for `logs_dir`
pub fn last_run_log_path(logs_dir: Option<&Path>) -> PathBuf {
    logs_dir.unwrap_or_else(|| Path::new("logs")).join(LAST_RUN_LOG)
}

/// `RUST_LOG` wins over the level picked on the command line.
fn console_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Console verbosity selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Failed attempts and fatal diagnostics only
    Error,
    /// Also dropped frames, slow transforms and transcoder warnings
    Warn,
    /// Also state changes, restarts and throttled progress
    Info,
    /// Also every transcoder diagnostic line
    Debug,
    /// Also every relayed frame
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        Level::from(self)
    }
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_last_run_log_path() {
        assert_eq!(
            last_run_log_path(None),
            Path::new("logs").join("framerelay-last-run.log")
        );
        assert_eq!(
            last_run_log_path(Some(Path::new("/var/log/relay"))),
            PathBuf::from("/var/log/relay/framerelay-last-run.log")
        );
    }

    #[test]
    fn test_unwritable_log_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let result = init_tracing(Level::INFO, Some(&blocker.join("logs")));

        assert!(matches!(result, Err(TracingError::LogDirectory { .. })));
    }
}
