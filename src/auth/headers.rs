use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{EngineError, EngineResult};

/// CLOB API credentials derived once per wallet. `secret` is a base64url
/// HMAC key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCreds {
    #[serde(alias = "apiKey")]
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Wallet-signed one-shot auth headers (EIP-712 ClobAuth).
#[derive(Debug, Clone)]
pub struct L1Headers {
    pub address: String,
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
}

impl L1Headers {
    pub fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("POLY_ADDRESS", &self.address)
            .header("POLY_SIGNATURE", &self.signature)
            .header("POLY_TIMESTAMP", &self.timestamp)
            .header("POLY_NONCE", &self.nonce)
    }
}

/// API-key HMAC per-request auth headers.
#[derive(Debug, Clone)]
pub struct L2Headers {
    pub address: String,
    pub signature: String,
    pub timestamp: String,
    pub key: String,
    pub passphrase: String,
}

impl L2Headers {
    pub fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("POLY_ADDRESS", &self.address)
            .header("POLY_SIGNATURE", &self.signature)
            .header("POLY_TIMESTAMP", &self.timestamp)
            .header("POLY_API_KEY", &self.key)
            .header("POLY_PASSPHRASE", &self.passphrase)
    }
}

/// Compute the L2 request signature:
/// base64url(HMAC_SHA256(decode(secret), timestamp + METHOD + path + body)).
/// The query string is excluded from the signed path.
pub fn l2_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> EngineResult<String> {
    let path_only = request_path.split('?').next().unwrap_or(request_path);
    let payload = format!("{}{}{}{}", timestamp, method.to_uppercase(), path_only, body);
    let key = decode_secret(secret)?;
    Ok(base64_url_encode(&hmac_sha256(&key, payload.as_bytes())))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Decode a base64url secret, tolerating standard-alphabet and unpadded
/// inputs: `+`/`/` are normalized to `-`/`_` before decoding.
pub fn decode_secret(secret: &str) -> EngineResult<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();

    base64::engine::general_purpose::URL_SAFE
        .decode(&normalized)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(normalized.trim_end_matches('=')))
        .map_err(|e| EngineError::Auth(format!("bad HMAC secret: {e}")))
}

/// Encode with the URL-safe alphabet, keeping `=` padding.
pub fn base64_url_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_url_safe_padded() {
        // 0xfb 0xef 0xff forces '-' and '_' in url-safe output
        assert_eq!(base64_url_encode(&[0xfb, 0xef, 0xff]), "--__");
        assert_eq!(base64_url_encode(b"hello"), "aGVsbG8=");
    }

    #[test]
    fn decode_tolerates_standard_alphabet() {
        let key = [0xfb_u8, 0xef, 0xff, 0x01];
        let standard = base64::engine::general_purpose::STANDARD.encode(key);
        assert!(standard.contains('+') || standard.contains('/'));
        assert_eq!(decode_secret(&standard).unwrap(), key);
    }

    #[test]
    fn decode_tolerates_missing_padding() {
        assert_eq!(decode_secret("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_secret("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn l2_signature_matches_known_vector() {
        // HMAC key "key", payload "1700000000GET/data/orders"
        let secret = base64_url_encode(b"key");
        let sig = l2_signature(&secret, "1700000000", "get", "/data/orders?market=x", "").unwrap();
        let expected =
            base64_url_encode(&hmac_sha256(b"key", b"1700000000GET/data/orders"));
        assert_eq!(sig, expected);
    }

    #[test]
    fn l2_signature_includes_body() {
        let secret = base64_url_encode(b"key");
        let with = l2_signature(&secret, "1", "POST", "/order", "{\"a\":1}").unwrap();
        let without = l2_signature(&secret, "1", "POST", "/order", "").unwrap();
        assert_ne!(with, without);
    }
}
