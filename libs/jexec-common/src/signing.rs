// Request signing shared by the API server and its callers.
//
// The signature is HMAC-SHA256 over the exact request body bytes, hex
// encoded. Callers must sign the same bytes they send: serializing the
// payload twice can produce different bytes and an invalid signature.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const BEARER_PREFIX: &str = "Bearer ";

/// Hex-encoded HMAC-SHA256 of `body` keyed with `secret`
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature against `body`
pub fn verify_body(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(provided) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac = mac_for(secret);
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Constant-time comparison of a bearer credential with the configured secret
pub fn credential_matches(provided: &str, secret: &str) -> bool {
    provided.as_bytes().ct_eq(secret.as_bytes()).into()
}

/// Value for the `Authorization` header
pub fn bearer_header(secret: &str) -> String {
    format!("{}{}", BEARER_PREFIX, secret)
}

fn mac_for(secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
}
