#![forbid(unsafe_code)]

//! Installs the global `tracing` subscriber.

use anyhow::{Context, Result};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSettings;

pub const LOG_FILE_NAME: &str = "downloader.log";

/// Keeps the file writer flushing; drop it only when the process is done
/// logging.
#[must_use]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// `RUST_LOG` when set, otherwise the configured level.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}")),
    }
}

pub fn init_logging(settings: &LoggingSettings) -> Result<LoggingGuard> {
    let filter = build_filter(&settings.level)?;

    let console = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let (file, guard) = if settings.file {
        fs::create_dir_all(&settings.log_dir)
            .with_context(|| format!("creating log directory {}", settings.log_dir.display()))?;
        let (writer, guard) = non_blocking(rolling::never(&settings.log_dir, LOG_FILE_NAME));
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    Registry::default()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("installing log subscriber")?;

    Ok(LoggingGuard { _file: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_builds_a_filter() {
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("bulktube_tools=trace,warn").is_ok());
    }
}
