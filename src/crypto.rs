//! Keyed hashing and comparison primitives.
//!
//! Everything that compares secret material goes through a constant-time path:
//! HMAC verification uses the MAC's own `verify_slice`, and plain byte
//! comparisons use `subtle`.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::types::{ApiKeyHash, ApiKeyPrefix, TokenHash};

type HmacSha256 = Hmac<Sha256>;

/// Pre-keyed HMAC-SHA256 instance.
#[derive(Clone)]
pub struct HmacKey {
    mac: HmacSha256,
    key_len: usize,
}

impl HmacKey {
    /// Minimum allowed key length in bytes (256 bits).
    pub const MIN_KEY_LENGTH: usize = 32;

    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, HmacKeyError> {
        let key = key.as_ref();
        if key.len() < Self::MIN_KEY_LENGTH {
            return Err(HmacKeyError::KeyTooShort {
                actual: key.len(),
                minimum: Self::MIN_KEY_LENGTH,
            });
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|_| HmacKeyError::InvalidKey)?;
        Ok(Self {
            mac,
            key_len: key.len(),
        })
    }

    /// Sign data and return the MAC bytes.
    pub fn sign(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = self.mac.clone();
        mac.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    /// Sign data and return the lowercase hex MAC.
    pub fn sign_hex(&self, data: &[u8]) -> String {
        hex::encode(self.sign(data))
    }

    /// Verify a signature in constant time.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.verify_slice(signature).is_ok()
    }
}

impl fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacKey")
            .field("key_length", &self.key_len)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur when creating an HMAC key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmacKeyError {
    KeyTooShort { actual: usize, minimum: usize },
    InvalidKey,
}

impl fmt::Display for HmacKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyTooShort { actual, minimum } => write!(
                f,
                "HMAC key too short: got {} bytes, need at least {}",
                actual, minimum
            ),
            Self::InvalidKey => write!(f, "HMAC key rejected"),
        }
    }
}

impl std::error::Error for HmacKeyError {}

/// Constant-time byte comparison. Length is not treated as secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash a raw bearer token for use as a cache key.
pub fn hash_token(token: &str) -> TokenHash {
    TokenHash::new(sha256_hex(token))
}

/// Hash an API key for storage and lookup (raw keys are never kept).
pub fn hash_api_key(key: &str) -> ApiKeyHash {
    ApiKeyHash::new(sha256_hex(key))
}

/// Generate a new API key with the format: prefix_randompart
/// Returns (full_key, prefix, hash)
pub fn generate_api_key() -> (String, ApiKeyPrefix, ApiKeyHash) {
    use uuid::Uuid;

    let prefix = ApiKeyPrefix::new(format!("ag_{}", &Uuid::new_v4().simple().to_string()[..8]));
    let secret = Uuid::new_v4().simple().to_string();
    let full_key = format!("{}_{}", prefix, secret);
    let key_hash = hash_api_key(&full_key);

    (full_key, prefix, key_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_hmac_key_too_short() {
        let result = HmacKey::new("short");
        assert!(matches!(
            result,
            Err(HmacKeyError::KeyTooShort {
                actual: 5,
                minimum: 32
            })
        ));
    }

    #[test]
    fn test_hmac_sign_verify() {
        let key = HmacKey::new(KEY).unwrap();
        let data = b"GET|/orders|1700000000|7|";
        let signature = key.sign(data);
        assert!(key.verify(data, &signature));
        assert!(!key.verify(b"GET|/orders|1700000001|7|", &signature));
        assert!(!key.verify(data, &signature[..31]));
    }

    #[test]
    fn test_sign_hex_matches_sign() {
        let key = HmacKey::new(KEY).unwrap();
        let hex_sig = key.sign_hex(b"payload");
        assert_eq!(hex_sig.len(), 64);
        assert_eq!(hex::decode(&hex_sig).unwrap(), key.sign(b"payload").to_vec());
    }

    #[test]
    fn test_debug_hides_key() {
        let key = HmacKey::new(KEY).unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains("key_length"));
        assert!(!debug.contains("0123456789"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_hash_token() {
        let hash1 = hash_token("eyJhbGciOi.payload.sig");
        let hash2 = hash_token("eyJhbGciOi.payload.sig");
        let hash3 = hash_token("other");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.as_str().len(), 64);
        assert!(hash1.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_api_key() {
        let (full_key, prefix, hash) = generate_api_key();

        assert!(full_key.starts_with("ag_"));
        assert!(full_key.starts_with(prefix.as_str()));
        assert_eq!(hash, hash_api_key(&full_key));

        let (other, _, _) = generate_api_key();
        assert_ne!(full_key, other);
    }
}
