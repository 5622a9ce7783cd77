//! HMAC-SHA256 request signing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

/// Shortest shared secret accepted at startup.
pub const MIN_SECRET_LEN: usize = 16;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Signature header value for `body`: `sha256=<lowercase hex>`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, DeliveryError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| DeliveryError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Constant-time check of a received signature header.
pub fn verify(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
