//! User-key and activation-key files.
//!
//! Both keys are stored as hex-encoded JSON envelopes `{payload, signature}`
//! whose payload is sealed under the wire cipher. Opening one is always:
//! read, hex-decode, JSON-decode, verify signature, decrypt. The user key
//! carries a CSV record plus session-key material; the activation key
//! carries a JSON [`AkInfo`].

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file not found: {0}")]
    MissingKey(PathBuf),
    #[error("key signature verification failed")]
    InvalidSignature,
    #[error("cannot decrypt key material: {0}")]
    DecryptFailed(#[source] CryptoError),
    #[error("corrupt key: {reason}")]
    CorruptKey { reason: String },
    #[error("cannot read key file: {0}")]
    Io(#[from] std::io::Error),
}

impl KeyError {
    fn corrupt(reason: impl Into<String>) -> Self {
        KeyError::CorruptKey {
            reason: reason.into(),
        }
    }
}

/// Signed user-key envelope as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserKey {
    pub uk: String,
    pub s: String,
}

/// Decrypted user-key record: who to ask for an activation key, where,
/// and with which session-key material.
#[derive(Clone, Debug)]
pub struct UserKeyInfo {
    pub username: String,
    pub uri: String,
    pub iv: Vec<u8>,
    pub sk: Vec<u8>,
    pub expiry: Option<DateTime<Utc>>,
}

/// Signed activation-key envelope as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ActivationEnvelope {
    pub ak: String,
    pub s: String,
}

/// Decrypted activation key: the agent's grant to talk to the control
/// plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AkInfo {
    pub host_uuid: String,
    pub device_id: String,
    pub ctl_uri: String,
    pub expiry: DateTime<Utc>,
    pub verify_key: String,
}

impl AkInfo {
    /// Reject activation keys missing any of the fields the agent relies
    /// on for the rest of its lifetime.
    pub fn validate(&self) -> Result<(), KeyError> {
        if self.verify_key.is_empty() {
            return Err(KeyError::corrupt("activation key has no verification key"));
        }
        if self.device_id.is_empty() {
            return Err(KeyError::corrupt("activation key has no device id"));
        }
        if self.host_uuid.is_empty() {
            return Err(KeyError::corrupt("activation key has no host identifier"));
        }
        Ok(())
    }
}

fn read_hex_envelope(path: &Path) -> Result<Vec<u8>, KeyError> {
    if !path.exists() {
        return Err(KeyError::MissingKey(path.to_path_buf()));
    }
    let blob = fs::read_to_string(path)?;
    hex::decode(blob.trim()).map_err(|e| KeyError::corrupt(format!("not a hex blob: {e}")))
}

/// Load the user-key envelope from `path` without opening it.
pub fn load_user_key(path: &Path) -> Result<UserKey, KeyError> {
    let decoded = read_hex_envelope(path)?;
    serde_json::from_slice(&decoded)
        .map_err(|e| KeyError::corrupt(format!("user key envelope: {e}")))
}

/// Verify and decrypt a user key.
///
/// The sealed payload is a hex string over `12-byte IV || 32-byte session
/// key || "username,uri,expiry_days"`.
pub fn read_user_key(key: &UserKey) -> Result<UserKeyInfo, KeyError> {
    if !crypto::verify(&key.uk, &key.s) {
        return Err(KeyError::InvalidSignature);
    }
    let inner = crypto::wire_decrypt(&key.uk).map_err(KeyError::DecryptFailed)?;
    let payload =
        hex::decode(&inner).map_err(|e| KeyError::corrupt(format!("user key payload: {e}")))?;
    if payload.len() <= 44 {
        return Err(KeyError::corrupt("user key payload too short"));
    }
    let record = String::from_utf8(payload[44..].to_vec())
        .map_err(|_| KeyError::corrupt("user key record is not UTF-8"))?;
    let parts: Vec<&str> = record.split(',').collect();
    if parts.len() != 3 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(KeyError::corrupt("user key record is not username,uri,expiry"));
    }
    let days: i64 = parts[2]
        .trim()
        .parse()
        .map_err(|_| KeyError::corrupt("user key expiry is not a number"))?;
    let expiry = (days > 0).then(|| Utc::now() + Duration::days(days));
    Ok(UserKeyInfo {
        username: parts[0].to_string(),
        uri: parts[1].to_string(),
        iv: payload[..12].to_vec(),
        sk: payload[12..44].to_vec(),
        expiry,
    })
}

/// Load, verify and decrypt the activation key at `path`.
pub fn load_activation_key(path: &Path) -> Result<AkInfo, KeyError> {
    let decoded = read_hex_envelope(path)?;
    let envelope: ActivationEnvelope = serde_json::from_slice(&decoded)
        .map_err(|e| KeyError::corrupt(format!("activation key envelope: {e}")))?;
    if !crypto::verify(&envelope.ak, &envelope.s) {
        return Err(KeyError::InvalidSignature);
    }
    let inner = crypto::wire_decrypt(&envelope.ak).map_err(KeyError::DecryptFailed)?;
    serde_json::from_str(&inner)
        .map_err(|e| KeyError::corrupt(format!("activation key record: {e}")))
}

/// Envelope minting for provisioning tools and test fixtures. The agent
/// never writes keys through this path; the control plane and operator
/// tooling do.
pub mod provision {
    use super::*;

    /// Seal a signed user-key blob ready to be written to `.userkey`.
    pub fn sealed_user_key(
        username: &str,
        uri: &str,
        expiry_days: i64,
        iv: &[u8; 12],
        sk: &[u8; 32],
    ) -> String {
        let mut payload = Vec::with_capacity(44 + username.len() + uri.len() + 8);
        payload.extend_from_slice(iv);
        payload.extend_from_slice(sk);
        payload.extend_from_slice(format!("{username},{uri},{expiry_days}").as_bytes());
        let sealed = crypto::wire_encrypt(&hex::encode(payload)).expect("wire cipher accepts any payload");
        let envelope = UserKey {
            s: crypto::sign(&sealed),
            uk: sealed,
        };
        hex::encode(serde_json::to_vec(&envelope).expect("envelope serializes"))
    }

    /// Seal a signed activation blob, as the activation endpoint returns it.
    pub fn sealed_activation_key(info: &AkInfo) -> String {
        let sealed = crypto::wire_encrypt(&serde_json::to_string(info).expect("record serializes"))
            .expect("wire cipher accepts any payload");
        let envelope = ActivationEnvelope {
            s: crypto::sign(&sealed),
            ak: sealed,
        };
        hex::encode(serde_json::to_vec(&envelope).expect("envelope serializes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_user_key(dir: &Path, blob: &str) -> PathBuf {
        let path = dir.join(".userkey");
        fs::write(&path, blob).unwrap();
        path
    }

    #[test]
    fn user_key_round_trip() {
        let tmp = TempDir::new().unwrap();
        let blob = provision::sealed_user_key("acme", "https://ctl.acme.io", 30, &[1; 12], &[2; 32]);
        let path = write_user_key(tmp.path(), &blob);

        let key = load_user_key(&path).unwrap();
        let info = read_user_key(&key).unwrap();
        assert_eq!(info.username, "acme");
        assert_eq!(info.uri, "https://ctl.acme.io");
        assert_eq!(info.iv, vec![1; 12]);
        assert_eq!(info.sk, vec![2; 32]);
        assert!(info.expiry.unwrap() > Utc::now());
    }

    #[test]
    fn zero_expiry_days_means_no_expiry() {
        let tmp = TempDir::new().unwrap();
        let blob = provision::sealed_user_key("acme", "https://ctl.acme.io", 0, &[1; 12], &[2; 32]);
        let path = write_user_key(tmp.path(), &blob);
        let info = read_user_key(&load_user_key(&path).unwrap()).unwrap();
        assert!(info.expiry.is_none());
    }

    #[test]
    fn missing_file_is_missing_key() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            load_user_key(&tmp.path().join(".userkey")),
            Err(KeyError::MissingKey(_))
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let blob = provision::sealed_user_key("acme", "https://ctl.acme.io", 30, &[1; 12], &[2; 32]);
        let path = write_user_key(tmp.path(), &blob);
        let mut key = load_user_key(&path).unwrap();
        key.s = crypto::sign("something else");
        assert!(matches!(read_user_key(&key), Err(KeyError::InvalidSignature)));
    }

    #[test]
    fn activation_key_round_trip_and_validation() {
        let tmp = TempDir::new().unwrap();
        let info = AkInfo {
            host_uuid: "9f2e".into(),
            device_id: "02:00:00:00:00:01".into(),
            ctl_uri: "https://ctl-a,https://ctl-b".into(),
            expiry: Utc::now() + Duration::days(30),
            verify_key: "vk".into(),
        };
        let path = tmp.path().join(".pilot");
        fs::write(&path, provision::sealed_activation_key(&info)).unwrap();

        let loaded = load_activation_key(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.device_id, info.device_id);
        assert_eq!(loaded.ctl_uri, info.ctl_uri);
    }

    #[test]
    fn activation_key_without_device_id_fails_validation() {
        let info = AkInfo {
            host_uuid: "9f2e".into(),
            device_id: String::new(),
            ctl_uri: "https://ctl".into(),
            expiry: Utc::now(),
            verify_key: "vk".into(),
        };
        assert!(matches!(info.validate(), Err(KeyError::CorruptKey { .. })));
    }

    #[test]
    fn non_hex_blob_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = write_user_key(tmp.path(), "not hex at all");
        assert!(matches!(
            load_user_key(&path),
            Err(KeyError::CorruptKey { .. })
        ));
    }
}
