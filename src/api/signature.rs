use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{Error, Result};

/// HMAC-SHA256 request signer
///
/// The secret is base64 on the wire and is decoded once at construction,
/// so a bad secret fails at startup rather than on the first order.
#[derive(Clone)]
pub struct RequestSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequestSigner([REDACTED])")
    }
}

impl RequestSigner {
    pub fn new(secret: &str) -> Result<Self> {
        let key = BASE64
            .decode(secret.trim())
            .map_err(|_| Error::Configuration("signing secret is not valid base64".to_string()))?;
        if key.is_empty() {
            return Err(Error::Configuration("signing secret is empty".to_string()));
        }
        Ok(Self { key })
    }

    /// base64(HMAC-SHA256(timestamp + method + path + body))
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let prehash = format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body);

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| Error::Configuration(format!("invalid signing key: {}", e)))?;
        mac.update(prehash.as_bytes());

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}
