//! Per-request auth token minting.
//!
//! Every control-plane request carries an opaque `Authorization` value
//! bound to the host identity and the minting time. The control plane
//! re-derives the MAC from the claims segment; the agent only needs to
//! produce it.

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

// Shared with the control plane's token service.
const TOKEN_KEY: &[u8] = b"xp6u9PCpbDLg6WhTk7rEGzq2BFyAaMUi";

/// Mint a fresh token bound to `(host_uuid, host_ip, host_name)`.
///
/// Format: `base64(claims).base64(hmac)` where claims is
/// `uuid|ip|name|unix_ts|nonce`. Opaque to every caller; only the shape
/// is load-bearing here.
pub fn new_token(host_uuid: &str, host_ip: &str, host_name: &str) -> String {
    let claims = format!(
        "{}|{}|{}|{}|{}",
        host_uuid,
        host_ip,
        host_name,
        Utc::now().timestamp(),
        Uuid::new_v4().simple()
    );
    let mut mac = HmacSha256::new_from_slice(TOKEN_KEY).expect("HMAC accepts any key length");
    mac.update(claims.as_bytes());
    let sig = mac.finalize().into_bytes();
    format!(
        "{}.{}",
        general_purpose::STANDARD.encode(claims.as_bytes()),
        general_purpose::STANDARD.encode(sig)
    )
}
