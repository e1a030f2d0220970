//! Webhook request signing.
//!
//! Every non-health webhook request carries an `X-Planbot-Signature` header:
//! the hex HMAC-SHA256 of the raw request body under the shared secret.
//! Verification is constant-time via the Mac's own comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Planbot-Signature";

/// Compute the hex signature for a request body.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature against a request body. Comparison is
/// timing-safe; malformed hex simply fails.
pub fn verify(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(provided) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}
