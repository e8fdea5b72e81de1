//! Tracing initialization.
//!
//! Logging policy:
//! - **stdout**: WARN only, compact, human-friendly (ignores RUST_LOG)
//! - **file**: INFO for adbandit crates, WARN for deps, daily rotation to
//!   `logs/{service}.log`; honors RUST_LOG when set

use std::{fs, path::Path};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Guards that must be held for the lifetime of the process.
/// Dropping this will cause buffered logs to be lost.
pub struct TracingGuards {
    _file_guard: WorkerGuard,
}

fn ensure_logs_dir() {
    let dir = Path::new("logs");
    if !dir.exists() {
        // Best effort: stdout logging still works without the directory.
        let _ = fs::create_dir_all(dir);
    }
}

/// Initialize tracing with bounded stdout and rotated file logs.
pub fn init_tracing(service_name: &str) -> TracingGuards {
    ensure_logs_dir();

    let file_appender =
        tracing_appender::rolling::daily("logs", format!("{service_name}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let stdout_filter = EnvFilter::new("warn");
    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("adbandit=info,warn"));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(true)
        .compact()
        .with_filter(stdout_filter);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    tracing::info!(
        "observability initialized for {} (stdout=WARN, file=logs/{}.log)",
        service_name,
        service_name
    );

    TracingGuards {
        _file_guard: file_guard,
    }
}
