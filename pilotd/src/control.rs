//! Control-plane HTTP client.
//!
//! Built once after activation. The activation key may carry several
//! control URIs as a comma-separated list; construction probes them in
//! order and elects the first one that answers the unauthenticated root
//! with 200. The election holds for the life of the process.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, info, warn};

use pilot_common::{
    token, ConnResult, CveRequest, HostInfo, PingRequest, PingResponse, RegistrationRequest,
    RegistrationResponse, MAX_EVENTS_PER_PING,
};

use crate::config::PilotPaths;
use crate::event_spool;
use crate::job_queue::QueueError;
use crate::keystore::AkInfo;
use crate::worker::Worker;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("cannot resolve a valid control endpoint")]
    EndpointNotFound,
    #[error("control endpoint found but refused the probe with {code}")]
    ProbeRefused { code: u16 },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control plane returned {code}")]
    Status { code: u16 },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Authenticated client pinned to the elected control URI.
#[derive(Debug)]
pub struct ControlClient {
    client: reqwest::Client,
    base_uri: String,
    host: HostInfo,
}

impl ControlClient {
    /// Probe the activation key's URI candidates and elect one.
    pub async fn connect(
        ak: &AkInfo,
        host: HostInfo,
        insecure_skip_verify: bool,
    ) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_verify)
            .timeout(CLIENT_TIMEOUT)
            .build()?;

        for uri in ak.ctl_uri.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            info!(%uri, "probing control URI");
            match client.get(uri).send().await {
                Err(e) => {
                    warn!(%uri, error = %e, "cannot connect to control URI");
                }
                Ok(resp) if resp.status() == StatusCode::OK => {
                    info!(%uri, "elected control URI");
                    return Ok(Self {
                        client,
                        base_uri: uri.to_string(),
                        host,
                    });
                }
                Ok(resp) => {
                    return Err(ControlError::ProbeRefused {
                        code: resp.status().as_u16(),
                    });
                }
            }
        }
        Err(ControlError::EndpointNotFound)
    }

    fn token(&self) -> String {
        token::new_token(&self.host.host_uuid, &self.host.host_ip, &self.host.hostname)
    }

    async fn post_json<B: serde::Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ControlError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_uri))
            .header(AUTHORIZATION, self.token())
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() > 299 {
            return Err(ControlError::Status {
                code: status.as_u16(),
            });
        }
        Ok(resp.json().await?)
    }

    /// Register this host with the control plane. Called once at startup;
    /// a refusal is fatal there.
    pub async fn register(&self) -> Result<RegistrationResponse, ControlError> {
        let request = RegistrationRequest::from_host(&self.host);
        self.post_json("/register", &request).await
    }

    /// One ping: piggyback the oldest pending result, else a batch of
    /// events, else nothing. Local state is only cleaned up after the
    /// control plane answers 2xx; a refused ping leaves the same payload
    /// for the next tick.
    pub async fn ping(
        &self,
        worker: &Worker,
        paths: &PilotPaths,
    ) -> Result<PingResponse, ControlError> {
        let result = worker.result()?;
        let events = if result.is_none() {
            event_spool::get_events(paths, MAX_EVENTS_PER_PING)?
        } else {
            None
        };
        let payload = PingRequest {
            result: result.clone(),
            events,
        };
        let sent_events = payload.events.is_some();

        let response: PingResponse = self.post_json("/ping", &payload).await?;

        if let Some(result) = result {
            if let Err(e) = worker.remove_result(&result) {
                error!(job_id = result.job_id, error = %e, "cannot remove delivered job result");
            }
        }
        if sent_events {
            if let Err(e) = event_spool::remove_events(paths) {
                error!(error = %e, "cannot remove delivered events");
            }
        }
        Ok(response)
    }

    /// Upload a finished CVE report.
    pub async fn submit_cve_report(&self, report: Vec<u8>) -> Result<(), ControlError> {
        let request = CveRequest {
            host_uuid: self.host.host_uuid.clone(),
            report,
        };
        let resp = self
            .client
            .post(format!("{}/cve/upload", self.base_uri))
            .header(AUTHORIZATION, self.token())
            .header(CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() > 299 {
            return Err(ControlError::Status {
                code: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Forward one telemetry file to its channel endpoint. The caller
    /// deletes the source only when the returned result carries no error.
    pub async fn submit_telemetry(
        &self,
        channel: &str,
        content: Vec<u8>,
        kind: &str,
    ) -> Result<ConnResult, ControlError> {
        let resp = self
            .client
            .post(format!("{}/{kind}/{channel}", self.base_uri))
            .header(AUTHORIZATION, self.token())
            .body(content)
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() > 299 {
            return Err(ControlError::Status {
                code: status.as_u16(),
            });
        }
        Ok(resp.json().await?)
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }
}
