// SPDX-License-Identifier: Apache-2.0

//! Logging setup: JSON lines to a daily rolling file.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "veil.log";

/// Installs the global subscriber. Calling it twice keeps the first one.
pub fn init_tracing(config: &LoggingConfig) {
    let log_dir = &config.directory;
    let _ = fs::create_dir_all(log_dir);

    if let Err(e) = cleanup_old_logs(log_dir, config.retention_days) {
        eprintln!("Failed to clean up old logs: {e}");
    }

    let file_appender: RollingFileAppender =
        tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(file_appender)
        .json()
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("PANIC: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("PANIC: {s}")
        } else {
            "PANIC: unknown cause".to_string()
        };

        tracing::error!(target: "panic", location = %location, message = %msg, "Panic");
        previous_hook(panic_info);
    }));

    tracing::info!("Tracing initialized. Logs directory: {:?}", log_dir);
}

/// Removes `veil.log*` files older than `retention_days`.
fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {path:?}: {e}"),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_only_touches_expired_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("veil.log.2026-10-17");
        let other = dir.path().join("notes.txt");
        fs::write(&fresh, "{}").unwrap();
        fs::write(&other, "keep").unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), 14).unwrap(), 0);
        assert!(fresh.exists());

        // with no retention every log file is already expired
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cleanup_old_logs(dir.path(), 0).unwrap(), 1);
        assert!(!fresh.exists());
        assert!(other.exists());
    }
}
