//! Usage: Process-wide tracing setup (env filter, stderr, optional daily log file).

use crate::infra::settings::PortalSettings;
use crate::shared::error::{AppError, AppResult};
use std::io::IsTerminal;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

pub const LOG_FILE_PREFIX: &str = "portal-session.log";

/// Keeps the file writer flushing; drop it only at shutdown.
#[must_use = "dropping the guard stops writing to the log file"]
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// `RUST_LOG` wins over the configured filter; a filter that does not parse
/// falls back to `info`.
pub(crate) fn build_env_filter(configured: &str) -> EnvFilter {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| configured.trim().to_string());

    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    match builder.parse(&directives) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("invalid log filter {directives:?} ({err}); using info");
            EnvFilter::new("info")
        }
    }
}

/// Install the global subscriber. A second call (or another subscriber
/// already installed, e.g. by a test harness) leaves the existing one alone.
pub fn init(settings: &PortalSettings) -> AppResult<LoggingGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false);

    let (file_layer, file_guard) = match settings.log_dir.as_deref() {
        Some(dir) => {
            let (layer, guard) = file_layer(dir)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(file_layer)
        .with(build_env_filter(&settings.log_filter))
        .with(stderr_layer);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed; keeping it");
        return Ok(LoggingGuard::default());
    }
    if let Err(err) = tracing_log::LogTracer::init() {
        tracing::debug!("log bridge already installed: {}", err);
    }

    tracing::info!(
        filter = %settings.log_filter,
        log_dir = settings
            .log_dir
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        "logging initialised"
    );
    Ok(LoggingGuard { _file: file_guard })
}

fn file_layer(
    dir: &Path,
) -> AppResult<(Box<dyn Layer<Registry> + Send + Sync>, WorkerGuard)> {
    std::fs::create_dir_all(dir).map_err(|e| {
        AppError::with_source(
            "LOGGING_ERROR",
            format!("failed to create log dir {}", dir.display()),
            e,
        )
    })?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .boxed();
    Ok((layer, guard))
}
