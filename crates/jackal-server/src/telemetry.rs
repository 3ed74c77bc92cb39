//! Logging setup.
//!
//! `logger.level` sets the default filter directive; `RUST_LOG` overrides it.
//! Output goes to `logger.log_path` through a non-blocking writer, or to
//! stdout when no path is configured.

use std::fs::OpenOptions;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggerConfig;

/// Install the global subscriber. The returned guard flushes buffered lines
/// when dropped and must live until the process exits.
pub fn init(config: &LoggerConfig) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(&config.level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    match &config.log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_ansi(false).with_writer(writer))
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(default_level(level)?.into())
        .from_env_lossy())
}

fn default_level(level: &str) -> Result<LevelFilter> {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "" => LevelFilter::INFO,
        // "warning" and "fatal" are accepted for compatibility with older files
        "warning" => LevelFilter::WARN,
        "fatal" => LevelFilter::ERROR,
        other => other
            .parse::<LevelFilter>()
            .with_context(|| format!("unknown log level {other:?}"))?,
    };
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level() {
        assert_eq!(default_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(default_level("WARNING").unwrap(), LevelFilter::WARN);
        assert_eq!(default_level("").unwrap(), LevelFilter::INFO);
        assert_eq!(default_level("fatal").unwrap(), LevelFilter::ERROR);
        assert!(default_level("verbose").is_err());
    }
}
