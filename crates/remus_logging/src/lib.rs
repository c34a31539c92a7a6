//! Shared logging utilities for Remus binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "remus_server=info,remus_worker=info,remus_client=info";

/// Logging configuration shared by Remus binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a daily-rolling file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = tracing_appender::rolling::daily(log_dir, config.app_name);

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Get the Remus home directory: ~/.remus
pub fn remus_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("REMUS_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".remus"))
        .unwrap_or_else(|| PathBuf::from(".remus"))
}

/// Get the logs directory: ~/.remus/logs
pub fn logs_dir() -> PathBuf {
    remus_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_override() {
        std::env::set_var("REMUS_HOME", "/tmp/remus-test-home");
        assert_eq!(remus_home(), PathBuf::from("/tmp/remus-test-home"));
        assert_eq!(logs_dir(), PathBuf::from("/tmp/remus-test-home/logs"));
        std::env::remove_var("REMUS_HOME");
    }
}
