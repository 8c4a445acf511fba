//! # talon-policy — capability tokens and deny-by-default evaluation
//!
//! Security invariant: only the policy engine issues tokens; only the tool
//! broker verifies them. An intent executes iff evaluation produced a signed
//! capability token binding `(session, subject, tool, constraints, expiry)`.
//!
//! - [`tokens`] — HMAC-SHA-256 issuer/verifier over the canonical payload
//! - [`engine`] — per-session allowlist overrides on a deny-by-default base

pub mod engine;
pub mod tokens;

pub use engine::{CapabilityPolicyEngine, PolicyEngine};
pub use tokens::{Clock, FixedClock, Issuer, SystemClock, TokenError, Verifier};
