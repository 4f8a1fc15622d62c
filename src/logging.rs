use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{self, RollingFileAppender},
};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};
use uuid::Uuid;

use crate::config::{LoggingConfig, LoggingRotation};

const LOG_FILE_PREFIX: &str = "spirits.log";

/// Keeps the non-blocking file writer alive; drop it last.
pub struct LoggingGuard {
    _worker_guard: WorkerGuard,
}

/// Installs the global subscriber for one replay run. `logging_config.dir`
/// is expected to be resolved already, see [`crate::config::Config::load`].
pub fn init_tracing(logging_config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = logging_config.dir.as_path();
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create logging directory {}", log_dir.display()))?;

    let cutoff = retention_cutoff(logging_config.retention_days, SystemTime::now());
    let purge_warnings = purge_expired_logs(log_dir, LOG_FILE_PREFIX, cutoff);
    let env_filter = build_env_filter(&logging_config.filter)?;
    let (file_writer, worker_guard) =
        tracing_appender::non_blocking(rolling_appender(log_dir, &logging_config.rotation));

    let file_layer = fmt::layer()
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(true)
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(env_filter);

    let stderr_layer = logging_config.stderr_warn_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(LevelFilter::WARN)
    });

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    let run_id = Uuid::now_v7().to_string();
    tracing::info!(
        target: "logging",
        run_id = %run_id,
        dir = %log_dir.display(),
        filter = %logging_config.filter,
        rotation = ?logging_config.rotation,
        retention_days = logging_config.retention_days,
        "logging_initialized"
    );
    for warning in purge_warnings {
        tracing::warn!(target: "logging", warning = %warning, "logging_retention_warning");
    }

    Ok(LoggingGuard {
        _worker_guard: worker_guard,
    })
}

fn build_env_filter(filter: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(filter)
        .with_context(|| format!("failed to parse logging.filter '{filter}'"))
}

fn rolling_appender(log_dir: &Path, rotation: &LoggingRotation) -> RollingFileAppender {
    match rotation {
        LoggingRotation::Daily => rolling::daily(log_dir, LOG_FILE_PREFIX),
        LoggingRotation::Hourly => rolling::hourly(log_dir, LOG_FILE_PREFIX),
    }
}

fn retention_cutoff(retention_days: usize, now: SystemTime) -> SystemTime {
    let retention = Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60) as u64);
    now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Removes `prefix`-named log files last modified at or before `cutoff`.
/// Failures come back as warnings; a stale log never blocks a replay.
fn purge_expired_logs(log_dir: &Path, prefix: &str, cutoff: SystemTime) -> Vec<String> {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(err) => return vec![format!("failed to scan {}: {err}", log_dir.display())],
    };

    let mut warnings = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let path = entry.path();
        let expired = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .map(|modified| path.is_file() && modified <= cutoff);
        let outcome = match expired {
            Ok(true) => fs::remove_file(&path),
            Ok(false) => continue,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warnings.push(format!("failed to purge {}: {err}", path.display()));
        }
    }

    warnings
}
