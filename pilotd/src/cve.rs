//! CVE report forwarding.
//!
//! An external scanner drops finished reports into a configured path; the
//! agent uploads and deletes them. Uploads are smeared with a random
//! pre-upload wait so a fleet of agents does not stampede the control
//! plane when a scan sweep finishes everywhere at once.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::control::ControlClient;

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

pub struct CveScanner {
    path: PathBuf,
    upload_delay_mins: u64,
    api: Arc<ControlClient>,
}

impl CveScanner {
    pub fn new(path: PathBuf, upload_delay_mins: u64, api: Arc<ControlClient>) -> Self {
        Self {
            path,
            upload_delay_mins,
            api,
        }
    }

    /// Spawn the scan loop. Runs until process exit.
    pub fn start(self) {
        tokio::spawn(async move {
            info!(path = %self.path.display(), "cve report scanner started");
            loop {
                self.scan_once().await;
                sleep(SCAN_INTERVAL).await;
            }
        });
    }

    async fn scan_once(&self) {
        let reports = match report_files(&self.path) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot scan cve report path");
                return;
            }
        };
        for report in reports {
            sleep(self.upload_jitter()).await;
            let content = match fs::read(&report) {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %report.display(), error = %e, "cannot read cve report");
                    continue;
                }
            };
            match self.api.submit_cve_report(content).await {
                Ok(()) => {
                    info!(file = %report.display(), "cve report uploaded");
                    if let Err(e) = fs::remove_file(&report) {
                        warn!(file = %report.display(), error = %e, "cannot delete uploaded cve report");
                    }
                }
                Err(e) => {
                    // left in place, picked up again on the next scan
                    warn!(file = %report.display(), error = %e, "cannot upload cve report");
                }
            }
        }
    }

    fn upload_jitter(&self) -> Duration {
        if self.upload_delay_mins == 0 {
            return Duration::ZERO;
        }
        let max_secs = self.upload_delay_mins * 60;
        Duration::from_secs(rand::thread_rng().gen_range(0..=max_secs))
    }
}

fn report_files(path: &std::path::Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| !n.to_string_lossy().starts_with('.'))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
