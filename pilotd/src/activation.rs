//! First-boot activation protocol.
//!
//! On entry, a present activation key short-circuits to validation. With
//! only a user key on disk, the agent drives the two-stage exchange: a
//! bearer token sealed under the user key's session material buys a
//! signed, encrypted activation key from the activation endpoint. The
//! exchange retries forever; a fresh host with correct credentials must
//! eventually come online.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use pilot_common::HostInfo;

use crate::config::PilotPaths;
use crate::crypto;
use crate::keystore::{self, AkInfo, KeyError, UserKeyInfo};

const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(60);
const BACKOFF_CEILING_MINS: u64 = 60;
const JITTER_CEILING_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("missing user key, cannot activate")]
    MissingUserKey,
    #[error("activation key expired")]
    Expired,
    #[error("activation key does not belong to this device (device id {device_id})")]
    DeviceMismatch { device_id: String },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("cannot build activation http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("cannot write activation key: {0}")]
    Io(#[from] std::io::Error),
}

/// Knobs the activation driver needs from the CLI/environment.
#[derive(Clone, Debug, Default)]
pub struct ActivationOptions {
    /// Identify the device by hardware UUID instead of primary MAC.
    pub use_hw_id: bool,
    /// Accept any server TLS certificate. Documented hazard: exposes the
    /// exchange to machine-in-the-middle interception.
    pub insecure_skip_verify: bool,
    /// Override for the user-key file location (`PILOT_USER_KEY`).
    pub user_key_path: Option<PathBuf>,
    /// Override for the activation endpoint (`PILOT_ACTIVATION_URI`).
    pub activation_uri: Option<String>,
    /// Log refused responses at debug level (`PILOT_DEBUG`).
    pub debug: bool,
}

#[derive(Serialize)]
struct BearerClaims<'a> {
    username: &'a str,
    device_id: &'a str,
    ip_address: &'a str,
    hostname: &'a str,
    time: chrono::DateTime<Utc>,
}

/// Build the `Bearer <username> <ciphertext>` header for the activation
/// request. The claims travel hex-encoded inside the user key's session
/// cipher, so only the issuing control plane can read them.
pub fn bearer_token(
    user: &UserKeyInfo,
    host: &HostInfo,
    use_hw_id: bool,
) -> Result<String, crypto::CryptoError> {
    let device_id = if use_hw_id {
        &host.hardware_id
    } else {
        &host.primary_mac
    };
    let claims = serde_json::to_vec(&BearerClaims {
        username: &user.username,
        device_id,
        ip_address: &host.host_ip,
        hostname: &host.hostname,
        time: Utc::now(),
    })
    .expect("claims serialize");
    let sealed = crypto::encrypt(&user.sk, &hex::encode(claims), &user.iv)?;
    Ok(format!("Bearer {} {}", user.username, sealed))
}

/// Wait before retry `failures`: `min(2^failures, 60)` minutes plus up to
/// 30 seconds of jitter. Monotone in the failure count, capped at an hour.
pub fn next_interval(failures: u32) -> Duration {
    let mins = 2u64
        .checked_pow(failures)
        .unwrap_or(BACKOFF_CEILING_MINS)
        .min(BACKOFF_CEILING_MINS);
    let jitter = rand::thread_rng().gen_range(0..=JITTER_CEILING_SECS);
    Duration::from_secs(mins * 60 + jitter)
}

/// One activation attempt: POST the bearer header, expect 201, persist
/// the body verbatim. Returns the transport/status failure as a string so
/// the retry loop can log it without treating it as fatal.
pub async fn request_activation_key(
    client: &reqwest::Client,
    uri: &str,
    token: &str,
    target: &Path,
    debug: bool,
) -> Result<(), String> {
    let endpoint = format!("{uri}/activation-key");
    debug!(%endpoint, "requesting activation key");
    let resp = client
        .post(&endpoint)
        .header(reqwest::header::AUTHORIZATION, token)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .timeout(ACTIVATION_TIMEOUT)
        .send()
        .await
        .map_err(|e| format!("cannot reach activation endpoint: {e}"))?;

    let status = resp.status();
    if status != reqwest::StatusCode::CREATED {
        let detail = if debug {
            resp.text().await.unwrap_or_default()
        } else {
            String::new()
        };
        if debug {
            debug!(code = status.as_u16(), body = %detail, "activation refused");
        }
        return Err(format!("activation key request failed with code {status}"));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| format!("cannot read activation response: {e}"))?;

    // Stage through a sibling temp file so a failed attempt never leaves a
    // partial key behind.
    let staged_name = format!(
        "{}.tmp",
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ".pilot".to_string())
    );
    let tmp = target.with_file_name(staged_name);
    fs::write(&tmp, &body).map_err(|e| format!("cannot stage activation key: {e}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
    }
    fs::rename(&tmp, target).map_err(|e| format!("cannot commit activation key: {e}"))?;
    Ok(())
}

/// Drive activation to completion and return the validated key.
///
/// Blocks indefinitely on first boot while the activation endpoint is
/// unreachable; every later boot takes the fast path.
pub async fn activate(
    paths: &PilotPaths,
    host: &mut HostInfo,
    opts: &ActivationOptions,
) -> Result<AkInfo, ActivationError> {
    let ak_file = paths.activation_file();
    if !ak_file.exists() {
        let user_key_file = opts
            .user_key_path
            .clone()
            .unwrap_or_else(|| paths.user_key_file());
        if !user_key_file.exists() {
            return Err(ActivationError::MissingUserKey);
        }
        info!("no activation key found, initiating activation protocol");
        let user_key = keystore::load_user_key(&user_key_file)?;
        let user = keystore::read_user_key(&user_key)?;
        let uri = opts
            .activation_uri
            .clone()
            .unwrap_or_else(|| user.uri.clone());

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(opts.insecure_skip_verify)
            .build()?;

        let mut failures: u32 = 0;
        loop {
            let token = bearer_token(&user, host, opts.use_hw_id)
                .map_err(|e| KeyError::CorruptKey {
                    reason: format!("user key session material rejected: {e}"),
                })?;
            match request_activation_key(&client, &uri, &token, &ak_file, opts.debug).await {
                Ok(()) => break,
                Err(reason) => {
                    let wait = next_interval(failures);
                    warn!(
                        %reason,
                        retry_in_mins = wait.as_secs_f64() / 60.0,
                        "cannot retrieve activation key"
                    );
                    sleep(wait).await;
                    failures = failures.saturating_add(1);
                }
            }
        }
        info!("activation key deployed");
    }

    let ak = keystore::load_activation_key(&ak_file)?;
    ak.validate()?;
    if ak.expiry <= Utc::now() {
        return Err(ActivationError::Expired);
    }
    if opts.use_hw_id {
        if ak.device_id != host.hardware_id {
            return Err(ActivationError::DeviceMismatch {
                device_id: host.hardware_id.clone(),
            });
        }
    } else if !host.mac_address.iter().any(|mac| *mac == ak.device_id) {
        return Err(ActivationError::DeviceMismatch {
            device_id: host.primary_mac.clone(),
        });
    }
    host.host_uuid = ak.host_uuid.clone();
    Ok(ak)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostInfo {
        HostInfo {
            hostname: "host-a".into(),
            host_ip: "10.0.0.7".into(),
            primary_mac: "02:00:00:00:00:01".into(),
            mac_address: vec!["02:00:00:00:00:01".into()],
            hardware_id: "hw-uuid-1".into(),
            ..HostInfo::default()
        }
    }

    fn user() -> UserKeyInfo {
        UserKeyInfo {
            username: "acme".into(),
            uri: "https://activation".into(),
            iv: vec![1; 12],
            sk: vec![2; 32],
            expiry: None,
        }
    }

    #[test]
    fn next_interval_is_monotone_and_capped() {
        for f in 0..12 {
            let a = next_interval(f).as_secs();
            let b = next_interval(f + 1).as_secs();
            // deterministic part is monotone; jitter is bounded by 30s
            assert!(b + JITTER_CEILING_SECS >= a);
            assert!(a <= BACKOFF_CEILING_MINS * 60 + JITTER_CEILING_SECS);
        }
        // first failures wait on the order of minutes
        assert!(next_interval(0).as_secs() >= 60);
        assert!(next_interval(0).as_secs() <= 60 + JITTER_CEILING_SECS);
    }

    #[test]
    fn interval_never_overflows_on_large_counts() {
        assert!(next_interval(u32::MAX).as_secs() <= BACKOFF_CEILING_MINS * 60 + JITTER_CEILING_SECS);
    }

    #[test]
    fn bearer_token_uses_mac_by_default_and_hw_id_on_request() {
        let u = user();
        let h = host();

        for (use_hw, expected) in [(false, "02:00:00:00:00:01"), (true, "hw-uuid-1")] {
            let token = bearer_token(&u, &h, use_hw).unwrap();
            let mut parts = token.splitn(3, ' ');
            assert_eq!(parts.next(), Some("Bearer"));
            assert_eq!(parts.next(), Some("acme"));
            let sealed = parts.next().unwrap();
            let inner = crypto::decrypt(&u.sk, sealed, &u.iv).unwrap();
            let claims: serde_json::Value =
                serde_json::from_slice(&hex::decode(inner).unwrap()).unwrap();
            assert_eq!(claims["device_id"], expected);
            assert_eq!(claims["hostname"], "host-a");
        }
    }
}
