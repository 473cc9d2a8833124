//! Agent supervisor.
//!
//! Owns the startup sequence (activation, endpoint election,
//! registration, worker, telemetry, CVE scanner) and then the ping
//! ticker. There is no shutdown path: the process runs until killed, and
//! the job pipeline's markers absorb whatever that interrupts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use pilot_common::{HostInfo, DEFAULT_PING_INTERVAL_SECS};

use crate::activation::{self, ActivationOptions};
use crate::config::{PilotConfig, PilotPaths};
use crate::control::ControlClient;
use crate::cve::CveScanner;
use crate::telemetry::TelemetryControl;
use crate::worker::{CommandExecutor, Worker};

/// Launch options from the CLI surface.
#[derive(Clone, Debug, Default)]
pub struct PilotOptions {
    pub use_hw_id: bool,
    pub telemetry: bool,
    pub insecure_skip_verify: bool,
    pub cve_path: Option<PathBuf>,
    pub cve_upload_delay_mins: u64,
}

pub struct Pilot {
    config: PilotConfig,
    paths: PilotPaths,
    options: PilotOptions,
    api: Arc<ControlClient>,
    worker: Worker,
}

impl Pilot {
    /// Run the startup sequence through activation and endpoint election.
    /// Blocks indefinitely on first boot until activation succeeds.
    pub async fn new(options: PilotOptions) -> Result<Self> {
        let config = PilotConfig::load();
        let paths = PilotPaths::resolve()?;
        paths.ensure_dirs()?;

        let mut host = HostInfo::collect();
        debug!(hostname = %host.hostname, ip = %host.host_ip, "host information collected");

        let activation_opts = ActivationOptions {
            use_hw_id: options.use_hw_id,
            insecure_skip_verify: options.insecure_skip_verify,
            user_key_path: config.user_key_path.clone(),
            activation_uri: config.activation_uri.clone(),
            debug: config.debug,
        };
        let ak = activation::activate(&paths, &mut host, &activation_opts)
            .await
            .context("cannot activate pilot")?;
        info!(host_uuid = %host.host_uuid, "pilot activated");

        let api = ControlClient::connect(&ak, host, options.insecure_skip_verify)
            .await
            .context("cannot connect to pilot control")?;

        let worker = Worker::new(paths.clone(), Arc::new(CommandExecutor));

        Ok(Self {
            config,
            paths,
            options,
            api: Arc::new(api),
            worker,
        })
    }

    /// Register, start the background consumers, and run the ping loop
    /// forever.
    pub async fn start(self) -> Result<()> {
        let registration = self
            .api
            .register()
            .await
            .context("cannot register host with pilot control")?;
        info!(operation = %registration.operation, uri = %self.api.base_uri(), "host registered");

        self.worker.start();

        if self.options.telemetry {
            let control = TelemetryControl::discover(&self.config.telemetry_path)
                .context("cannot enumerate telemetry channels")?;
            info!(channels = control.channel_count(), "starting telemetry fan-out");
            control.start(Arc::clone(&self.api));
        }

        if let Some(cve_path) = self.options.cve_path.clone() {
            CveScanner::new(
                cve_path,
                self.options.cve_upload_delay_mins,
                Arc::clone(&self.api),
            )
            .start();
        }

        let mut interval = Duration::from_secs(DEFAULT_PING_INTERVAL_SECS);
        info!(interval_secs = interval.as_secs(), "entering ping loop");
        loop {
            match self.api.ping(&self.worker, &self.paths).await {
                Ok(response) => {
                    for cmd in &response.commands {
                        debug!(job_id = cmd.job_id, package = %cmd.package, "command received");
                        if let Err(e) = self.worker.add_job(cmd) {
                            warn!(job_id = cmd.job_id, error = %e, "cannot enqueue command");
                        }
                    }
                    if let Some(advised) = response.interval_secs.filter(|s| *s > 0) {
                        let advised = Duration::from_secs(advised);
                        if advised != interval {
                            info!(interval_secs = advised.as_secs(), "control plane advised new ping interval");
                            interval = advised;
                        }
                    }
                }
                Err(e) => {
                    // nothing was acknowledged; the same payload goes out
                    // on the next tick
                    warn!(error = %e, "ping failed");
                }
            }
            sleep(interval).await;
        }
    }
}
