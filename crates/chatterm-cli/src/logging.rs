//! Tracing setup: stderr (optional) plus a daily-rotated log file

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "CHATTERM_LOG_LEVEL";

/// `RUST_LOG`, else `CHATTERM_LOG_LEVEL` (`silent`, `fatal` accepted), else `warn`.
pub fn log_filter() -> EnvFilter {
    filter_from(std::env::var("RUST_LOG").ok(), std::env::var(LOG_LEVEL_ENV).ok())
}

fn filter_from(rust_log: Option<String>, level: Option<String>) -> EnvFilter {
    let level = if let Some(v) = rust_log {
        v
    } else if let Some(v) = level {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        // Interactive tool: stay quiet unless asked
        "warn".to_string()
    };

    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. The stderr layer is left out when the
/// terminal is in raw mode. Keep the returned guard alive to flush the file.
pub fn init(to_stderr: bool) -> Result<WorkerGuard> {
    let log_dir = chatterm_core::config::logs_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "chatterm.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = to_stderr.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(log_filter())
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    // Panic output may be lost behind a raw-mode screen; keep it in the log too
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let _ = crossterm::terminal::disable_raw_mode();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "chatterm panic: {}", payload);
    }));

    Ok(guard)
}
