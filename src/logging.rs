//! Logging setup for the narrator host.
//!
//! Terminal output goes to stderr so the demo text on stdout stays readable.
//! With `file` enabled, logs are also written to `<data dir>/narrator/narrator.log`
//! through a non-blocking writer. `NARRATOR_LOG` takes an `EnvFilter`
//! directive; otherwise `DEBUG_LOGGING=1` turns on debug output for this crate.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE: &str = "narrator.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Also write to the log file
    pub file: bool,
    /// Force debug output for this crate
    pub debug: bool,
    /// Overrides the log directory
    pub dir: Option<PathBuf>,
}

/// Filter directive: explicit `NARRATOR_LOG`, else info (debug for us if asked)
fn filter_directive(explicit: Option<String>, debug_logging: bool) -> String {
    match explicit.filter(|d| !d.trim().is_empty()) {
        Some(directive) => directive,
        None if debug_logging => "info,narrator=debug".to_string(),
        None => "info".to_string(),
    }
}

/// Installs the global subscriber.
///
/// Returns a `WorkerGuard` that MUST be held for the process lifetime when
/// file logging is on; dropping it flushes and stops the writer.
/// If the log directory cannot be created, falls back to terminal only.
pub fn init(options: LogOptions) -> Option<WorkerGuard> {
    let debug_logging = options.debug || std::env::var("DEBUG_LOGGING").is_ok();
    let directive = filter_directive(std::env::var("NARRATOR_LOG").ok(), debug_logging);

    if !options.file {
        init_terminal_only(&directive);
        return None;
    }

    let log_dir = options.dir.unwrap_or_else(crate::config::data_dir);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        // Pas encore de subscriber : eprintln
        eprintln!(
            "Failed to create log directory {:?}: {}, logging to terminal only",
            log_dir, e
        );
        init_terminal_only(&directive);
        return None;
    }

    let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_span_events(FmtSpan::NONE);

    let terminal_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::NONE);

    let installed = tracing_subscriber::registry()
        .with(file_layer)
        .with(terminal_layer)
        .with(EnvFilter::new(&directive))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            log_file = ?log_dir.join(LOG_FILE),
            debug_logging,
            "narrator logging initialized"
        );
    }
    Some(guard)
}

fn init_terminal_only(directive: &str) {
    let terminal_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::NONE);

    let _ = tracing_subscriber::registry()
        .with(terminal_layer)
        .with(EnvFilter::new(directive))
        .try_init();
}
