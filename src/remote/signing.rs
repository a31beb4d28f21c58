//! Request signing for the mapping backend
//!
//! The signature is HMAC-SHA256 over `METHOD PATH\nEXPIRES\nPAYLOAD`, keyed
//! with the base64-decoded credential secret and sent base64-encoded.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// HTTP verbs the backend API uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Credential secret is not valid base64: {0}")]
    BadSecret(#[from] base64::DecodeError),

    #[error("Credential secret is empty")]
    EmptySecret,

    #[error("Invalid key length")]
    InvalidKey,
}

/// String the signature is computed over
pub fn canonical_string(method: Method, path: &str, expires_ms: u64, payload: &str) -> String {
    format!("{} {}\n{}\n{}", method, path, expires_ms, payload)
}

/// Sign a request with a base64-encoded secret
pub fn sign(
    secret_b64: &str,
    method: Method,
    path: &str,
    expires_ms: u64,
    payload: &str,
) -> Result<String, SigningError> {
    if secret_b64.is_empty() {
        return Err(SigningError::EmptySecret);
    }
    let key = base64::engine::general_purpose::STANDARD.decode(secret_b64)?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SigningError::InvalidKey)?;
    mac.update(canonical_string(method, path, expires_ms, payload).as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    #[test]
    fn test_canonical_string_layout() {
        assert_eq!(
            canonical_string(Method::Post, "/api/v1/map/ABC/Marker", 1700000120000, "{}"),
            "POST /api/v1/map/ABC/Marker\n1700000120000\n{}"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = sign(SECRET, Method::Get, "/api/v1/map/ABC/since/0", 42, "").unwrap();
        let b = sign(SECRET, Method::Get, "/api/v1/map/ABC/since/0", 42, "").unwrap();
        assert_eq!(a, b);
        // 32-byte digest, base64 with padding
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn test_each_input_changes_signature() {
        let base = sign(SECRET, Method::Post, "/p", 42, "{}").unwrap();
        assert_ne!(base, sign(SECRET, Method::Get, "/p", 42, "{}").unwrap());
        assert_ne!(base, sign(SECRET, Method::Post, "/q", 42, "{}").unwrap());
        assert_ne!(base, sign(SECRET, Method::Post, "/p", 43, "{}").unwrap());
        assert_ne!(base, sign(SECRET, Method::Post, "/p", 42, "{ }").unwrap());
        assert_ne!(base, sign("b3RoZXItc2VjcmV0", Method::Post, "/p", 42, "{}").unwrap());
    }

    #[test]
    fn test_bad_secret() {
        assert!(matches!(sign("", Method::Get, "/", 0, ""), Err(SigningError::EmptySecret)));
        assert!(matches!(
            sign("not base64!!", Method::Get, "/", 0, ""),
            Err(SigningError::BadSecret(_))
        ));
    }
}
