//! Pilot control-plane wire types
//!
//! JSON bodies exchanged between a pilot host agent and the pilot control
//! service, shared so collaborating tools can speak the same contract.

pub mod host;
pub mod token;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use host::HostInfo;

/// Maximum number of spooled events piggybacked onto a single ping.
pub const MAX_EVENTS_PER_PING: usize = 5;

/// Default interval between pings when the server does not advise one.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 15;

/// A command descriptor issued by the control plane.
///
/// Keyed by `job_id`; the agent persists one `.job` file per descriptor
/// until the command has been executed and its result acknowledged.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CmdInfo {
    pub job_id: i64,
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub containerised: bool,
}

/// Outcome of executing a [`CmdInfo`] on the host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: i64,
    pub success: bool,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub err: String,
    pub time: DateTime<Utc>,
}

/// Ping request body: a pending job result takes precedence over events;
/// with neither, the body serializes to an empty object.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
}

/// Ping response: commands queued for this host plus an optional
/// server-advised ping interval.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PingResponse {
    #[serde(default)]
    pub commands: Vec<CmdInfo>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// Host registration request sent once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub hostname: String,
    pub machine_id: String,
    pub os: String,
    /// Formatted as `"<platform>, <family>, <version>"`.
    pub platform: String,
    pub virtual_machine: bool,
    pub total_memory: u64,
    pub cpus: usize,
    pub host_ip: String,
    pub mac_address: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RegistrationResponse {
    #[serde(default)]
    pub operation: String,
}

/// CVE report upload body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CveRequest {
    pub host_uuid: String,
    pub report: Vec<u8>,
}

/// A syslog event captured by the external collector and spooled as a
/// `.ev` file for the agent to forward. Unknown producer fields are
/// ignored; absent fields default.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Event {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub facility: i32,
    #[serde(default)]
    pub severity: i32,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub content: String,
}

/// Telemetry ingestion outcome. Short field names mirror the control-plane
/// contract; a non-empty `e` means the submission must be retried.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ConnResult {
    #[serde(rename = "e", default)]
    pub error: String,
    #[serde(rename = "t", default)]
    pub total_entries: i64,
    #[serde(rename = "s", default)]
    pub successful_entries: i64,
}

impl ConnResult {
    pub fn ok(&self) -> bool {
        self.error.is_empty()
    }
}

impl RegistrationRequest {
    /// Build a registration request from collected host information.
    pub fn from_host(info: &HostInfo) -> Self {
        Self {
            hostname: info.hostname.clone(),
            machine_id: info.host_uuid.clone(),
            os: info.os.clone(),
            platform: format!(
                "{}, {}, {}",
                info.platform, info.platform_family, info.platform_version
            ),
            virtual_machine: info.virtual_machine,
            total_memory: info.total_memory,
            cpus: info.cpus,
            host_ip: info.host_ip.clone(),
            mac_address: info.mac_address.clone(),
        }
    }
}
