//! Tracing subscriber setup.
//!
//! Console output goes to stderr so command output on stdout stays parseable.
//! When a log directory is configured, JSON lines are also written to a
//! daily rolling file through a non-blocking writer.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

pub const LOG_FILE_PREFIX: &str = "phasequeue.log";

/// Filter directives: `RUST_LOG` when set, else the configured level.
pub fn filter_directives(level: &str, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(directives) => directives.to_string(),
        None => level.trim().to_string(),
    }
}

pub fn build_filter(level: &str, rust_log: Option<&str>) -> Result<EnvFilter> {
    let directives = filter_directives(level, rust_log);
    EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter '{}'", directives))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(&config.level, rust_log.as_deref())?;

    let console = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    };

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins_over_configured_level() {
        assert_eq!(
            filter_directives("info", Some("phasequeue=trace")),
            "phasequeue=trace"
        );
    }

    #[test]
    fn test_blank_rust_log_falls_back() {
        assert_eq!(filter_directives("warn", Some("  ")), "warn");
        assert_eq!(filter_directives(" debug ", None), "debug");
    }

    #[test]
    fn test_build_filter_accepts_directive_lists() {
        assert!(build_filter("info", None).is_ok());
        assert!(build_filter("info", Some("phasequeue=debug,tower_http=warn")).is_ok());
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        assert!(build_filter("phasequeue=loudest", None).is_err());
    }
}
