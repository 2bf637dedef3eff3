use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::WarpError;

/// Filter used when neither `RUST_LOG` nor the caller names one: connection
/// lifecycle from the link layer, warnings from everything else.
pub const DEFAULT_FILTER: &str = "warn,warp_client=info,warp_protocol=info";

/// File name prefix of the rolling log.
const LOG_FILE_PREFIX: &str = "warp-client";

fn env_filter(filter: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)))
}

fn install_error(e: impl std::fmt::Display) -> WarpError {
    WarpError::Logging(format!("Failed to initialize logging: {e}"))
}

/// Install a compact console subscriber. `RUST_LOG` overrides `filter`.
pub fn init_logging(filter: Option<&str>) -> Result<(), WarpError> {
    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(install_error)
}

/// Log to a daily rolling `warp-client` file under `logs_dir`.
///
/// Connection tasks run on tokio worker threads, so file lines carry the
/// thread name next to the module target. Keep the returned guard alive for
/// as long as logs should be flushed.
pub fn init_logging_to_dir(logs_dir: &Path, filter: Option<&str>) -> Result<WorkerGuard, WarpError> {
    std::fs::create_dir_all(logs_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .map_err(install_error)?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; a second install errors
        // after the directory is created.
        let result = init_logging_to_dir(&logs_dir, Some("warn"));
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn test_second_install_reports_logging_error() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let first = init_logging_to_dir(&tmp.path().join("a"), None);
        let second = init_logging(Some("info"));

        // Whichever test got there first owns the global subscriber.
        assert!(first.is_err() || matches!(second, Err(WarpError::Logging(_))));
    }
}
