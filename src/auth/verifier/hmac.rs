//! HMAC-SHA256 signed requests.
//!
//! A signed request carries three values:
//!
//! * the hex signature, in `Authorization: HMAC <sig>` or `X-Auth-Signature`
//! * the signing identity, in `X-Auth-Identity`
//! * the signing time as unix seconds, in `X-Auth-Timestamp`
//!
//! The signature covers [`canonical_message`]. Requests whose timestamp is
//! more than the replay window away from server time are rejected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::Method;
use tracing::debug;

use super::{Verified, Verifier};
use crate::auth::context::PrincipalClaims;
use crate::auth::credential::{Credential, Scheme, X_AUTH_IDENTITY, X_AUTH_TIMESTAMP, header_value};
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::request::AuthRequest;
use crate::config::HmacSettings;
use crate::crypto::HmacKey;
use crate::types::PrincipalId;

#[derive(Debug)]
pub struct HmacOptions {
    pub key: HmacKey,
    pub replay_window: chrono::Duration,
}

impl HmacOptions {
    pub fn from_settings(settings: &HmacSettings) -> anyhow::Result<Self> {
        if settings.replay_window_secs == 0 {
            anyhow::bail!("HMAC replay window must be positive");
        }
        let key = HmacKey::new(settings.secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid HMAC secret: {}", e))?;
        Ok(Self {
            key,
            replay_window: settings.replay_window(),
        })
    }
}

/// Bytes covered by a request signature:
/// `METHOD|path|timestamp|identity|` followed by the raw body.
pub fn canonical_message(
    method: &Method,
    path: &str,
    timestamp: &str,
    identity: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut message =
        format!("{}|{}|{}|{}|", method.as_str(), path, timestamp, identity).into_bytes();
    message.extend_from_slice(body);
    message
}

/// Hex signature a client must send for the given request parts.
pub fn sign_request(
    key: &HmacKey,
    method: &Method,
    path: &str,
    timestamp: i64,
    identity: PrincipalId,
    body: &[u8],
) -> String {
    let message = canonical_message(
        method,
        path,
        &timestamp.to_string(),
        &identity.to_string(),
        body,
    );
    key.sign_hex(&message)
}

pub struct HmacVerifier {
    options: HmacOptions,
}

impl HmacVerifier {
    pub fn new(options: HmacOptions) -> Self {
        Self { options }
    }

    pub(crate) fn verify_at(
        &self,
        signature: &str,
        request: &AuthRequest,
        now: DateTime<Utc>,
    ) -> AuthResult<Verified> {
        let headers = request.headers();
        let identity =
            header_value(headers, X_AUTH_IDENTITY).ok_or(AuthError::VerificationFailed)?;
        let timestamp =
            header_value(headers, X_AUTH_TIMESTAMP).ok_or(AuthError::VerificationFailed)?;

        let principal_id: PrincipalId = identity
            .parse()
            .map_err(|_| AuthError::VerificationFailed)?;
        let signed_at: i64 = timestamp
            .parse()
            .map_err(|_| AuthError::VerificationFailed)?;

        let skew = now
            .timestamp()
            .checked_sub(signed_at)
            .map(i64::unsigned_abs)
            .ok_or(AuthError::VerificationFailed)?;
        if skew > self.options.replay_window.num_seconds().unsigned_abs() {
            debug!("HMAC request outside replay window ({}s skew)", skew);
            return Err(AuthError::VerificationFailed);
        }

        let signature = hex::decode(signature).map_err(|_| AuthError::VerificationFailed)?;
        let message = canonical_message(
            request.method(),
            request.path(),
            timestamp,
            identity,
            request.body(),
        );
        if !self.options.key.verify(&message, &signature) {
            debug!("HMAC signature mismatch for {}", principal_id);
            return Err(AuthError::VerificationFailed);
        }

        let issued_at =
            DateTime::<Utc>::from_timestamp(signed_at, 0).ok_or(AuthError::VerificationFailed)?;
        Ok(Verified::new(PrincipalClaims::new(
            principal_id,
            issued_at,
            issued_at + self.options.replay_window,
        )))
    }
}

#[async_trait]
impl Verifier for HmacVerifier {
    fn scheme(&self) -> Scheme {
        Scheme::Hmac
    }

    async fn verify(&self, credential: &Credential, request: &AuthRequest) -> AuthResult<Verified> {
        self.verify_at(&credential.value, request, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "hmac-secret-hmac-secret-hmac-secret!";

    fn verifier() -> HmacVerifier {
        let settings = HmacSettings {
            secret: SECRET.to_string(),
            replay_window_secs: 300,
        };
        HmacVerifier::new(HmacOptions::from_settings(&settings).unwrap())
    }

    fn signed_request(ts: i64, body: &[u8]) -> (String, AuthRequest) {
        let key = HmacKey::new(SECRET).unwrap();
        let sig = sign_request(&key, &Method::POST, "/orders", ts, PrincipalId::new(9), body);
        let req = AuthRequest::new(Method::POST, "/orders")
            .with_header("X-Auth-Identity", "9")
            .with_header("X-Auth-Timestamp", &ts.to_string())
            .with_body(body.to_vec());
        (sig, req)
    }

    #[test]
    fn test_valid_signature() {
        let now = Utc::now();
        let (sig, req) = signed_request(now.timestamp(), b"{\"qty\":1}");
        let verified = verifier().verify_at(&sig, &req, now).unwrap();
        assert_eq!(verified.claims.principal_id, PrincipalId::new(9));
        assert_eq!(verified.claims.issued_at.timestamp(), now.timestamp());
        assert!(!verified.refresh_due);
    }

    #[test]
    fn test_replay_window_boundary() {
        let now = Utc::now();
        let verifier = verifier();

        let (sig, req) = signed_request(now.timestamp() - 300, b"");
        assert!(verifier.verify_at(&sig, &req, now).is_ok());

        let (sig, req) = signed_request(now.timestamp() - 301, b"");
        assert_eq!(
            verifier.verify_at(&sig, &req, now),
            Err(AuthError::VerificationFailed)
        );

        let (sig, req) = signed_request(now.timestamp() + 301, b"");
        assert!(verifier.verify_at(&sig, &req, now).is_err());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let now = Utc::now();
        let verifier = verifier();
        for ts in [i64::MIN, i64::MIN + 1, i64::MAX] {
            let (sig, req) = signed_request(ts, b"");
            assert_eq!(
                verifier.verify_at(&sig, &req, now),
                Err(AuthError::VerificationFailed),
                "timestamp {}",
                ts
            );
        }

        let req = AuthRequest::new(Method::POST, "/orders")
            .with_header("X-Auth-Identity", "9")
            .with_header("X-Auth-Timestamp", "-9223372036854775808");
        assert!(verifier.verify_at("00", &req, now).is_err());
    }

    #[test]
    fn test_any_flipped_signature_byte_fails() {
        let now = Utc::now();
        let verifier = verifier();
        let (sig, req) = signed_request(now.timestamp(), b"payload");
        let mut raw = hex::decode(&sig).unwrap();

        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let tampered = hex::encode(&raw);
            assert!(verifier.verify_at(&tampered, &req, now).is_err(), "byte {}", i);
            raw[i] ^= 0x01;
        }
        assert!(verifier.verify_at(&hex::encode(&raw), &req, now).is_ok());
    }

    #[test]
    fn test_body_is_covered() {
        let now = Utc::now();
        let (sig, _) = signed_request(now.timestamp(), b"original");
        let (_, tampered) = signed_request(now.timestamp(), b"changed");
        assert!(verifier().verify_at(&sig, &tampered, now).is_err());
    }

    #[test]
    fn test_missing_companion_headers() {
        let now = Utc::now();
        let (sig, _) = signed_request(now.timestamp(), b"");
        let req = AuthRequest::new(Method::POST, "/orders").with_header("X-Auth-Identity", "9");
        assert!(verifier().verify_at(&sig, &req, now).is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        let settings = HmacSettings {
            secret: "short".to_string(),
            replay_window_secs: 300,
        };
        assert!(HmacOptions::from_settings(&settings).is_err());
    }
}
