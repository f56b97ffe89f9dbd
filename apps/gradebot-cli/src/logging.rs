//! Logging initialization and log file management.
//!
//! Provides dual-output tracing: stderr (human-readable) and an
//! optional JSON log file at `<log_dir>/<timestamp>.log`, enabled with
//! the `--log-file` flag. Old log files are cleaned up at startup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Maximum age of log files before cleanup, in days.
const LOG_RETENTION_DAYS: u64 = 3;

/// Initialize the tracing subscriber with stderr output.
///
/// When `to_file` is set, an additional JSON file layer writes to
/// `<log_dir>/<YYYYMMDD_HHMMSS>.log`.
///
/// Returns an optional [`WorkerGuard`] that must be held for the
/// lifetime of the program to ensure all buffered logs are flushed.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the log
/// file cannot be opened.
pub fn init_tracing(log_dir: &Path, to_file: bool) -> Result<Option<WorkerGuard>> {
    if !to_file {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
        return Ok(None);
    }

    let (non_blocking, guard) = open_log_writer(log_dir)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::from_default_env()),
        )
        .init();

    Ok(Some(guard))
}

/// Create the log directory and file, returning a non-blocking writer
/// and its guard.
fn open_log_writer(
    log_dir: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let log_path = build_log_path(log_dir);
    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("failed to create log file: {}", log_path.display()))?;

    Ok(tracing_appender::non_blocking(log_file))
}

/// Remove `.log` files older than the retention window from `log_dir`.
///
/// This is a best-effort operation: errors on individual files are
/// reported via `eprintln!` (tracing is not initialized yet) but do
/// not cause the function to fail.
pub fn cleanup_old_logs(log_dir: &Path) {
    if !log_dir.is_dir() {
        return;
    }

    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!(
                "warning: failed to read log directory {}: {e}",
                log_dir.display()
            );
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                eprintln!(
                    "warning: failed to read metadata for {}: {e}",
                    path.display()
                );
                continue;
            }
        };

        if modified < cutoff
            && let Err(e) = fs::remove_file(&path)
        {
            eprintln!(
                "warning: failed to remove old log file {}: {e}",
                path.display(),
            );
        }
    }
}

/// Build the log file path: `<log_dir>/<YYYYMMDD_HHMMSS>.log`.
fn build_log_path(log_dir: &Path) -> PathBuf {
    let timestamp = format_utc_timestamp(std::time::SystemTime::now());
    log_dir.join(format!("{timestamp}.log"))
}

/// Format a [`SystemTime`](std::time::SystemTime) as `YYYYMMDD_HHMMSS`
/// in UTC without pulling in a date crate.
fn format_utc_timestamp(time: std::time::SystemTime) -> String {
    let secs = time
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let (year, month, day) = civil_date(secs / 86400);
    let (hours, minutes, seconds) = (
        secs % 86400 / 3600,
        secs % 3600 / 60,
        secs % 60,
    );

    format!("{year:04}{month:02}{day:02}_{hours:02}{minutes:02}{seconds:02}")
}

/// Convert days since the Unix epoch to a Gregorian (year, month, day).
///
/// Uses the civil_from_days algorithm (epoch shifted to 0000-03-01 so
/// leap days land at the end of the internal year).
fn civil_date(days_since_epoch: u64) -> (u64, u64, u64) {
    let z = days_since_epoch as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let day_of_era = z.rem_euclid(146_097) as u64;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_marker = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * month_marker + 2) / 5 + 1;
    let month = if month_marker < 10 {
        month_marker + 3
    } else {
        month_marker - 9
    };
    let year = (year_of_era as i64) + era * 400 + i64::from(month <= 2);

    (year as u64, month, day)
}
