//! `tracing` subscriber setup for the server and for one-shot CLI commands.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Rotated daily as `switchboard.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "switchboard.log";

/// Keeps the background log writer alive; dropping it flushes the file.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install JSON file logging under `logs_dir` plus a compact stderr layer.
///
/// `RUST_LOG` overrides the `info` default for both.
///
/// # Errors
///
/// Fails if `logs_dir` cannot be created or a global subscriber is already
/// installed.
pub fn init_server(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (file_writer, writer_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(file_writer);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter_or("info"))
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LoggingGuard {
        _writer: writer_guard,
    })
}

/// Stderr-only logging at `warn` so command output stays clean.
/// Repeat calls are no-ops.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
