//! Capability token signing and verification. HMAC-SHA-256 under a
//! server-wide secret.
//!
//! The signature covers the canonical JSON form of every token field except
//! `signature` itself, and verification recomputes it over the *received*
//! payload — so any mutation, constraints included, invalidates the token.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use talon_protocol::{CapId, CapabilityToken, SessionId};

/// Fallback secret for unconfigured development setups. Production loads the
/// real secret from the environment at startup.
const DEFAULT_SECRET: &str = "default-secret-change-in-production";

const DEFAULT_TTL_SECONDS: i64 = 60;

/// Unix-seconds clock, swappable so expiry behavior is testable without
/// sleeping.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Deterministic clock pinned to a fixed instant.
#[derive(Debug, Clone)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("invalid signature")]
    BadSignature,
    #[error("token serialization failed: {0}")]
    Serialization(String),
}

/// Signs capability tokens.
#[derive(Clone)]
pub struct Issuer {
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl Issuer {
    pub fn new(secret: &str) -> Self {
        Self::with_clock(secret, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret_bytes(secret),
            clock,
        }
    }

    /// Create a signed token for one tool action under the given constraints.
    ///
    /// `ttl_seconds <= 0` falls back to 60 seconds; `exp` is always strictly
    /// after `iat`.
    pub fn issue(
        &self,
        session_id: &SessionId,
        subject: &str,
        tool: &str,
        constraints: Value,
        ttl_seconds: i64,
    ) -> Result<CapabilityToken, TokenError> {
        let iat = self.clock.now_unix();
        let ttl = if ttl_seconds <= 0 {
            DEFAULT_TTL_SECONDS
        } else {
            ttl_seconds.max(1)
        };
        let cap_id = CapId::new();
        let nonce = format!("{iat}-{cap_id}");

        let mut token = CapabilityToken {
            cap_id,
            session_id: session_id.clone(),
            subject: subject.to_owned(),
            tool: tool.to_owned(),
            constraints,
            iat,
            exp: iat + ttl,
            nonce,
            signature: String::new(),
        };
        token.signature = sign_token(&token, &self.secret)?;
        Ok(token)
    }
}

/// Checks token signature and validity window. Holds the same secret as the
/// issuer.
#[derive(Clone)]
pub struct Verifier {
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl Verifier {
    pub fn new(secret: &str) -> Self {
        Self::with_clock(secret, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret_bytes(secret),
            clock,
        }
    }

    /// Returns `Ok(())` iff the token is inside its validity window and its
    /// signature matches the received payload. The comparison is constant
    /// time over the signature bytes.
    pub fn verify(&self, token: &CapabilityToken) -> Result<(), TokenError> {
        let now = self.clock.now_unix();
        if token.exp < now {
            return Err(TokenError::Expired);
        }
        if token.iat > now {
            return Err(TokenError::NotYetValid);
        }
        let expected = sign_token(token, &self.secret)?;
        if !bool::from(expected.as_bytes().ct_eq(token.signature.as_bytes())) {
            return Err(TokenError::BadSignature);
        }
        Ok(())
    }
}

fn secret_bytes(secret: &str) -> Vec<u8> {
    if secret.is_empty() {
        DEFAULT_SECRET.as_bytes().to_vec()
    } else {
        secret.as_bytes().to_vec()
    }
}

/// HMAC-SHA-256 over the canonical JSON of the token payload, `signature`
/// field excluded, encoded as padded standard base64.
fn sign_token(token: &CapabilityToken, secret: &[u8]) -> Result<String, TokenError> {
    let mut payload = serde_json::to_value(token)
        .map_err(|error| TokenError::Serialization(error.to_string()))?;
    if let Some(object) = payload.as_object_mut() {
        object.remove("signature");
    }
    let canonical = talon_protocol::canonical_json(&payload)
        .map_err(|error| TokenError::Serialization(error.to_string()))?;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(canonical.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}
