//! Environment-driven configuration and the on-disk layout.
//!
//! The agent keeps all of its state under a single root:
//!
//! ```text
//! <root>/.userkey              operator-provisioned user key
//! <root>/.pilot                activation key, written by the agent
//! <root>/data/                 markers and the event batch manifest
//! <root>/data/process/         pending command descriptors (*.job)
//! <root>/data/submit/          results (*.result) and events (*.ev)
//! ```
//!
//! The root resolves from `PILOT_CFG_PATH`, then `PILOT_HOME`, then the
//! directory holding the executable.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub const DEFAULT_SYSLOG_PORT: u16 = 1514;
pub const DEFAULT_TELEMETRY_PATH: &str = "telemetry";

/// Environment keys read at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    Home,
    CfgPath,
    LogLevel,
    SyslogPort,
    ActivationUri,
    UserKey,
    Debug,
    CvePath,
    TelemetryPath,
}

impl ConfigKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::Home => "PILOT_HOME",
            ConfigKey::CfgPath => "PILOT_CFG_PATH",
            ConfigKey::LogLevel => "PILOT_LOG_LEVEL",
            ConfigKey::SyslogPort => "PILOT_SYSLOG_PORT",
            ConfigKey::ActivationUri => "PILOT_ACTIVATION_URI",
            ConfigKey::UserKey => "PILOT_USER_KEY",
            ConfigKey::Debug => "PILOT_DEBUG",
            ConfigKey::CvePath => "PILOT_CVE_PATH",
            ConfigKey::TelemetryPath => "PILOT_CTL_TELEM_PATH",
        }
    }

    fn get(self) -> Option<String> {
        env::var(self.as_str()).ok().filter(|v| !v.is_empty())
    }
}

/// Configuration snapshot taken once at startup.
#[derive(Clone, Debug)]
pub struct PilotConfig {
    pub log_level: String,
    pub syslog_port: u16,
    pub activation_uri: Option<String>,
    pub user_key_path: Option<PathBuf>,
    pub debug: bool,
    pub cve_path: Option<PathBuf>,
    pub telemetry_path: PathBuf,
}

impl PilotConfig {
    pub fn load() -> Self {
        let syslog_port = ConfigKey::SyslogPort
            .get()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SYSLOG_PORT);
        Self {
            log_level: ConfigKey::LogLevel.get().unwrap_or_else(|| "info".into()),
            syslog_port,
            activation_uri: ConfigKey::ActivationUri.get(),
            user_key_path: ConfigKey::UserKey.get().map(PathBuf::from),
            debug: ConfigKey::Debug
                .get()
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            cve_path: ConfigKey::CvePath.get().map(PathBuf::from),
            telemetry_path: ConfigKey::TelemetryPath
                .get()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TELEMETRY_PATH)),
        }
    }
}

/// Resolved filesystem layout. Passed by value to every component that
/// touches disk; there is no global path state.
#[derive(Clone, Debug)]
pub struct PilotPaths {
    root: PathBuf,
}

impl PilotPaths {
    /// Resolve the root from the environment, falling back to the
    /// executable's directory.
    pub fn resolve() -> Result<Self> {
        let root = match ConfigKey::CfgPath.get().or_else(|| ConfigKey::Home.get()) {
            Some(p) => fs::canonicalize(&p)
                .with_context(|| format!("cannot resolve pilot root at {p}"))?,
            None => env::current_exe()
                .context("cannot locate executable")?
                .parent()
                .context("executable has no parent directory")?
                .to_path_buf(),
        };
        Ok(Self { root })
    }

    /// Root the layout at an explicit directory (tests, embedding).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn user_key_file(&self) -> PathBuf {
        self.root.join(".userkey")
    }

    pub fn activation_file(&self) -> PathBuf {
        self.root.join(".pilot")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn process_dir(&self) -> PathBuf {
        self.data_dir().join("process")
    }

    pub fn submit_dir(&self) -> PathBuf {
        self.data_dir().join("submit")
    }

    /// Create the data/process/submit tree if absent.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.data_dir(), self.process_dir(), self.submit_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_is_rooted() {
        let tmp = TempDir::new().unwrap();
        let paths = PilotPaths::at(tmp.path());
        assert_eq!(paths.user_key_file(), tmp.path().join(".userkey"));
        assert_eq!(paths.activation_file(), tmp.path().join(".pilot"));
        assert_eq!(paths.process_dir(), tmp.path().join("data/process"));
        assert_eq!(paths.submit_dir(), tmp.path().join("data/submit"));
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let tmp = TempDir::new().unwrap();
        let paths = PilotPaths::at(tmp.path());
        paths.ensure_dirs().unwrap();
        assert!(paths.process_dir().is_dir());
        assert!(paths.submit_dir().is_dir());
        // idempotent
        paths.ensure_dirs().unwrap();
    }
}
