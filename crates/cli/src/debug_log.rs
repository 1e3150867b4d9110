//! Debug file logging for mirsync
//!
//! Creates a trace log file at `/tmp/mirsync-{session_id}.log` when
//! requested. The session ID is a UUID generated at startup.

use std::path::PathBuf;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::Layer as _;

/// Debug log guard - keeps the file logger alive
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Session info returned after initializing debug logging
pub struct SessionInfo {
    pub log_path: PathBuf,
    pub guard: DebugLogGuard,
}

/// Initialize logging with an additional trace file.
///
/// Returns the session info including the log file path. The guard must be
/// kept alive for the duration of the program.
pub fn init(stderr_filter: &str) -> SessionInfo {
    let session_id = uuid::Uuid::new_v4();
    let log_filename = format!("mirsync-{session_id}.log");
    let log_path = PathBuf::from("/tmp").join(&log_filename);

    let file_appender = tracing_appender::rolling::never("/tmp", &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // File layer: detailed trace output
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(tracing_subscriber::EnvFilter::new("trace"));

    // Stderr layer: what the user asked for
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(tracing_subscriber::EnvFilter::new(stderr_filter));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    SessionInfo {
        log_path,
        guard: DebugLogGuard { _guard: guard },
    }
}
