//! `X-Hub-Signature-256` verification

use crate::DeployError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const PREFIX: &str = "sha256=";

/// `sha256=<hex hmac>` of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature header against the raw request body in constant time.
pub fn verify(secret: &str, body: &[u8], header: &str) -> Result<(), DeployError> {
    let hex_digest = header
        .trim()
        .strip_prefix(PREFIX)
        .ok_or(DeployError::Signature)?;
    let expected = hex::decode(hex_digest).map_err(|_| DeployError::Signature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| DeployError::Signature)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| DeployError::Signature)
}
