//! Request signing for the exchange REST API.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the canonical query string, hex-encoded.
pub fn sign_query(api_secret: &str, query: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|_| Error::Auth("invalid API secret".into()))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
