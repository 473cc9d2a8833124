//! Telemetry fan-out.
//!
//! Under the telemetry root, `logs/` and `metrics/` each hold one
//! subdirectory per channel. Every (kind, channel) pair gets its own
//! uploader task consuming the channel's oldest file; a stuck channel
//! backs off exponentially without holding up any other channel.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::control::ControlClient;

const EMPTY_CHANNEL_WAIT: Duration = Duration::from_secs(30);
const BACKOFF_CEILING_SECS: u64 = 3600;

/// Wait before upload retry `attempts`: `min(3600, (2^n - 1) / 2)`
/// seconds. The first two retries are immediate, then 1, 3, 7... up to an
/// hour.
pub fn backoff(attempts: u32) -> Duration {
    let doubled = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
    let secs = doubled.saturating_sub(1) / 2;
    Duration::from_secs(secs.min(BACKOFF_CEILING_SECS))
}

/// Channel discovery result: one directory per (kind, channel).
pub struct TelemetryControl {
    logs_channels: Vec<PathBuf>,
    metrics_channels: Vec<PathBuf>,
}

impl TelemetryControl {
    /// Enumerate channels under `root`. A missing kind directory skips
    /// that kind; discovering zero channels is not an error.
    pub fn discover(root: &Path) -> std::io::Result<Self> {
        Ok(Self {
            logs_channels: channel_dirs(&root.join("logs"))?,
            metrics_channels: channel_dirs(&root.join("metrics"))?,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.logs_channels.len() + self.metrics_channels.len()
    }

    /// Spawn one uploader per channel. Tasks run until process exit.
    pub fn start(self, api: Arc<ControlClient>) {
        for dir in self.logs_channels {
            tokio::spawn(run_uploader(dir, Arc::clone(&api), "logs"));
        }
        for dir in self.metrics_channels {
            tokio::spawn(run_uploader(dir, Arc::clone(&api), "metrics"));
        }
    }
}

fn channel_dirs(kind_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !kind_dir.exists() {
        info!(path = %kind_dir.display(), "telemetry kind path not found, skipping");
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(kind_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Infinite consume-oldest loop for a single channel directory.
async fn run_uploader(dir: PathBuf, api: Arc<ControlClient>, kind: &'static str) {
    let channel = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    info!(%kind, %channel, "telemetry uploader started");
    let mut failures: u32 = 0;
    loop {
        let oldest = match oldest_visible_file(&dir) {
            Ok(file) => file,
            Err(e) => {
                warn!(%kind, %channel, error = %e, "cannot list telemetry channel");
                sleep(EMPTY_CHANNEL_WAIT).await;
                continue;
            }
        };
        let Some(file) = oldest else {
            sleep(EMPTY_CHANNEL_WAIT).await;
            continue;
        };
        let content = match fs::read(&file) {
            Ok(c) => c,
            Err(e) => {
                warn!(%kind, %channel, file = %file.display(), error = %e, "cannot read telemetry file");
                sleep(EMPTY_CHANNEL_WAIT).await;
                continue;
            }
        };

        let failure = match api.submit_telemetry(&channel, content, kind).await {
            Err(e) => Some(e.to_string()),
            Ok(result) if !result.ok() => Some(result.error),
            Ok(_) => None,
        };
        match failure {
            Some(reason) => {
                let wait = backoff(failures);
                warn!(%kind, %channel, %reason, wait_secs = wait.as_secs(), "cannot submit telemetry");
                failures = failures.saturating_add(1);
                sleep(wait).await;
            }
            None => {
                failures = 0;
                if let Err(e) = fs::remove_file(&file) {
                    warn!(%kind, %channel, file = %file.display(), error = %e, "cannot delete submitted telemetry file");
                }
            }
        }
    }
}

/// Oldest non-hidden file in `dir` by modification time.
fn oldest_visible_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if hidden || !path.is_file() {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((mtime, path));
    }
    files.sort_by_key(|(mtime, _)| *mtime);
    Ok(files.into_iter().next().map(|(_, path)| path))
}
