//! Diagnostics for the hub client.
//!
//! Provides:
//! - **Build info**: version, build timestamp, git SHA, platform
//! - **Logging bootstrap**: console + daily rolling file via `tracing`
//! - **Log rotation helpers**: prune old files before the appender starts

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::HubError;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Version and build metadata embedded by `build.rs`.
pub fn build_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "nativeSupported": cfg!(windows),
    })
}

// ---------------------------------------------------------------------------
// Logging bootstrap
// ---------------------------------------------------------------------------

/// Install the global `tracing` subscriber (console + rolling file).
///
/// The returned guard flushes the file writer on drop; the application root
/// keeps it alive for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard, HubError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let dir = log_dir(config);
    fs::create_dir_all(&dir)
        .map_err(|e| HubError::Logging(format!("create {}: {e}", dir.display())))?;
    prune_old_logs(&dir, &config.file_prefix, config.max_files);

    let file_appender = tracing_appender::rolling::daily(&dir, &config.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| HubError::Logging(e.to_string()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        log_dir = %dir.display(),
        "pos-hub logging initialized"
    );
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Configured log directory, else the per-user data directory.
pub fn log_dir(config: &LoggingConfig) -> PathBuf {
    if let Some(dir) = &config.directory {
        return dir.clone();
    }

    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("pos-hub").join("logs")
}

/// Prune log files starting with `prefix`, keeping the newest `keep`.
///
/// Returns how many files were removed.
pub fn prune_old_logs(dir: &Path, prefix: &str, keep: usize) -> usize {
    if !dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(prefix))
                .unwrap_or(false);
            if matches {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune log file"),
        }
    }
    removed
}
