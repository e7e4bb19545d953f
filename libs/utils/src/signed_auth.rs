//! Shared-secret request signing for the internal HTTP surfaces.
//!
//! Every authority<->gateway call carries a millisecond timestamp and a
//! lowercase-hex `HMAC-SHA256(secret, "METHOD:PATH:BODY:TIMESTAMP")`.
//! The receiver rejects signatures outside the clock-skew window and
//! compares digests in constant time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const TIMESTAMP_HEADER: &str = "X-Internal-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Internal-Signature";

/// Secrets shorter than this are refused at startup.
pub const MIN_SECRET_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SignedAuthError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed {0} header")]
    MalformedHeader(&'static str),

    #[error("request timestamp outside the allowed clock skew")]
    StaleTimestamp,

    #[error("signature mismatch")]
    BadSignature,
}

/// Signer/verifier for one shared secret. Owned by the composition root
/// and handed to the HTTP layers and peer clients by `Arc`.
pub struct InternalAuth {
    secret: Vec<u8>,
    max_clock_skew: Duration,
}

impl InternalAuth {
    pub fn new(secret: &str, max_clock_skew: Duration) -> anyhow::Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            anyhow::bail!("internal API secret must be at least {MIN_SECRET_LEN} characters");
        }
        Ok(InternalAuth {
            secret: secret.as_bytes().to_vec(),
            max_clock_skew,
        })
    }

    fn mac_for(&self, method: &str, path: &str, body: &[u8], timestamp_ms: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(method.as_bytes());
        mac.update(b":");
        mac.update(path.as_bytes());
        mac.update(b":");
        mac.update(body);
        mac.update(b":");
        mac.update(timestamp_ms.to_string().as_bytes());
        mac
    }

    /// Lowercase-hex signature over the exact body bytes that will be
    /// sent. An empty body signs as the empty string, not as `{}`.
    pub fn sign(&self, method: &str, path: &str, body: &[u8], timestamp_ms: i64) -> String {
        let mac = self.mac_for(method, path, body, timestamp_ms);
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp_ms: i64,
        signature_hex: &str,
        now_ms: i64,
    ) -> Result<(), SignedAuthError> {
        let skew_ms = self.max_clock_skew.as_millis() as i64;
        if (now_ms - timestamp_ms).abs() > skew_ms {
            return Err(SignedAuthError::StaleTimestamp);
        }

        let provided =
            hex::decode(signature_hex).map_err(|_| SignedAuthError::BadSignature)?;
        let mac = self.mac_for(method, path, body, timestamp_ms);
        // verify_slice is the constant-time comparison.
        mac.verify_slice(&provided)
            .map_err(|_| SignedAuthError::BadSignature)
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Verify an incoming hyper request whose body has already been
/// buffered. Handlers on the internal surfaces call this before
/// deserializing anything.
pub fn verify_signed_request(
    auth: &InternalAuth,
    method: &hyper::Method,
    path: &str,
    headers: &hyper::HeaderMap,
    body: &[u8],
) -> Result<(), SignedAuthError> {
    let timestamp_ms = headers
        .get(TIMESTAMP_HEADER)
        .ok_or(SignedAuthError::MissingHeader(TIMESTAMP_HEADER))?
        .to_str()
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or(SignedAuthError::MalformedHeader(TIMESTAMP_HEADER))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .ok_or(SignedAuthError::MissingHeader(SIGNATURE_HEADER))?
        .to_str()
        .map_err(|_| SignedAuthError::MalformedHeader(SIGNATURE_HEADER))?;

    auth.verify(
        method.as_str(),
        path,
        body,
        timestamp_ms,
        signature,
        now_millis(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> InternalAuth {
        InternalAuth::new("super-secret-test-key", Duration::from_secs(300)).unwrap()
    }

    #[test]
    fn short_secrets_are_refused() {
        assert!(InternalAuth::new("too-short", Duration::from_secs(300)).is_err());
    }

    #[test]
    fn sign_verify_round_trip() {
        let auth = auth();
        let now = now_millis();
        let sig = auth.sign("POST", "/internal/schemas/provision", b"{\"x\":1}", now);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        auth.verify(
            "POST",
            "/internal/schemas/provision",
            b"{\"x\":1}",
            now,
            &sig,
            now,
        )
        .unwrap();
    }

    #[test]
    fn any_tuple_component_is_load_bearing() {
        let auth = auth();
        let now = now_millis();
        let sig = auth.sign("POST", "/internal/sessions/invalidate", b"{}", now);

        for (method, path, body, ts) in [
            ("DELETE", "/internal/sessions/invalidate", &b"{}"[..], now),
            ("POST", "/internal/schemas/provision", &b"{}"[..], now),
            ("POST", "/internal/sessions/invalidate", &b"{ }"[..], now),
            ("POST", "/internal/sessions/invalidate", &b"{}"[..], now + 1),
        ] {
            assert!(
                auth.verify(method, path, body, ts, &sig, now).is_err(),
                "accepted signature for ({method}, {path}, {body:?}, {ts})"
            );
        }
    }

    #[test]
    fn skew_window_is_exact() {
        let auth = auth();
        let now = now_millis();
        let skew_ms = 300 * 1000;

        let at_edge = now - skew_ms;
        let sig = auth.sign("GET", "/api/preview/schemas/active", b"", at_edge);
        auth.verify("GET", "/api/preview/schemas/active", b"", at_edge, &sig, now)
            .unwrap();

        let past_edge = now - skew_ms - 1;
        let sig = auth.sign("GET", "/api/preview/schemas/active", b"", past_edge);
        assert!(matches!(
            auth.verify("GET", "/api/preview/schemas/active", b"", past_edge, &sig, now),
            Err(SignedAuthError::StaleTimestamp)
        ));

        // Timestamps from the future are bounded by the same window.
        let future = now + skew_ms + 1;
        let sig = auth.sign("GET", "/api/preview/schemas/active", b"", future);
        assert!(auth
            .verify("GET", "/api/preview/schemas/active", b"", future, &sig, now)
            .is_err());
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let auth = auth();
        let now = now_millis();
        assert!(matches!(
            auth.verify("GET", "/x", b"", now, "zzzz-not-hex", now),
            Err(SignedAuthError::BadSignature)
        ));
        assert!(matches!(
            auth.verify("GET", "/x", b"", now, "deadbeef", now),
            Err(SignedAuthError::BadSignature)
        ));
    }
}
