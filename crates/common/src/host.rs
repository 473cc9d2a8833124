//! Best-effort host identity discovery.
//!
//! Everything here degrades to a placeholder rather than failing: a host
//! with an unreadable DMI tree still registers, it just carries less
//! detail. `host_uuid` is assigned by the control plane during activation
//! and filled in afterwards.

use std::fs;
use std::net::UdpSocket;
use std::path::Path;

use serde::{Deserialize, Serialize};

const UNKNOWN: &str = "unknown";

/// Identity and capacity of the host the agent runs on.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct HostInfo {
    /// Assigned by the control plane; empty until activation completes.
    #[serde(default)]
    pub host_uuid: String,
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub platform_family: String,
    pub platform_version: String,
    pub virtual_machine: bool,
    /// Total physical memory in bytes.
    pub total_memory: u64,
    pub cpus: usize,
    pub host_ip: String,
    /// MAC addresses of all non-loopback interfaces.
    pub mac_address: Vec<String>,
    /// First entry of `mac_address`.
    pub primary_mac: String,
    /// DMI product UUID, used instead of the MAC when `--hw-id` is set.
    pub hardware_id: String,
}

impl HostInfo {
    /// Collect host information from the running system.
    pub fn collect() -> Self {
        let mac_address = interface_macs("/sys/class/net");
        let primary_mac = mac_address.first().cloned().unwrap_or_default();
        let (platform, platform_version) = os_release();
        Self {
            host_uuid: String::new(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| UNKNOWN.to_string()),
            os: std::env::consts::OS.to_string(),
            platform,
            platform_family: std::env::consts::FAMILY.to_string(),
            platform_version,
            virtual_machine: is_virtual(),
            total_memory: total_memory_bytes(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            host_ip: outbound_ip(),
            mac_address,
            primary_mac,
            hardware_id: read_trimmed("/sys/class/dmi/id/product_uuid")
                .or_else(|| read_trimmed("/etc/machine-id"))
                .unwrap_or_else(|| UNKNOWN.to_string()),
        }
    }
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// MAC addresses of every interface under `base` except loopback.
fn interface_macs(base: &str) -> Vec<String> {
    let mut macs = Vec::new();
    let Ok(entries) = fs::read_dir(base) else {
        return macs;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lo" {
            continue;
        }
        if let Some(mac) = read_trimmed(entry.path().join("address")) {
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                macs.push(mac);
            }
        }
    }
    macs.sort();
    macs
}

/// NAME and VERSION_ID from /etc/os-release, quotes stripped.
fn os_release() -> (String, String) {
    let mut name = std::env::consts::OS.to_string();
    let mut version = UNKNOWN.to_string();
    if let Ok(content) = fs::read_to_string("/etc/os-release") {
        for line in content.lines() {
            if let Some(v) = line.strip_prefix("NAME=") {
                name = v.trim_matches('"').to_string();
            } else if let Some(v) = line.strip_prefix("VERSION_ID=") {
                version = v.trim_matches('"').to_string();
            }
        }
    }
    (name, version)
}

fn total_memory_bytes() -> u64 {
    let Ok(meminfo) = fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

fn is_virtual() -> bool {
    let vendor = read_trimmed("/sys/class/dmi/id/sys_vendor").unwrap_or_default();
    ["QEMU", "KVM", "VMware", "VirtualBox", "Xen", "Microsoft Corporation"]
        .iter()
        .any(|v| vendor.contains(v))
}

/// Local address of a UDP socket "connected" to a public resolver; no
/// traffic is sent.
fn outbound_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:53")?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn collect_never_panics_and_fills_basics() {
        let info = HostInfo::collect();
        assert!(!info.hostname.is_empty());
        assert!(info.cpus >= 1);
        assert!(!info.host_ip.is_empty());
    }

    #[test]
    fn interface_macs_skips_loopback_and_zero() {
        let tmp = TempDir::new().unwrap();
        for (ifname, mac) in [
            ("lo", "00:00:00:00:00:00"),
            ("eth0", "02:00:00:00:00:01"),
            ("veth1", "00:00:00:00:00:00"),
        ] {
            let dir = tmp.path().join(ifname);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("address"), format!("{mac}\n")).unwrap();
        }
        let macs = interface_macs(tmp.path().to_str().unwrap());
        assert_eq!(macs, vec!["02:00:00:00:00:01".to_string()]);
    }
}
