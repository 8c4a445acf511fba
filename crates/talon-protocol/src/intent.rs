//! Intents, policy decisions, session overrides, and capability tokens.
//!
//! Security invariant: only the policy engine issues tokens; only the tool
//! broker verifies and executes. `params` and `constraints` stay opaque JSON
//! at this boundary — each tool interprets its own constraint shape inside
//! the broker, so new tools never touch these types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{CapId, SessionId};

/// An agent's request to invoke a specific tool with specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolIntent {
    pub tool: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ToolIntent {
    pub fn new(tool: impl Into<String>, params: Value) -> Self {
        Self {
            tool: tool.into(),
            params,
            subject: None,
        }
    }

    /// The acting subject, defaulting to `"agent"` when absent.
    pub fn subject(&self) -> &str {
        self.subject
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("agent")
    }
}

/// Outcome of policy evaluation. Only `Allow` and `Deny` are produced;
/// `RequireApproval` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
            Self::RequireApproval => "REQUIRE_APPROVAL",
        }
    }
}

/// What the policy engine returns for one intent. `token` is present iff the
/// decision is `Allow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResult {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<CapabilityToken>,
}

/// One allowlist rule in a session policy. Rules are consulted in declared
/// order; the first `allow = true` entry with non-null constraints for the
/// intent's tool wins. `allow = false` entries are inert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOverride {
    pub tool: String,
    #[serde(default)]
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
}

impl RuleOverride {
    /// Constraints, if present and non-null. A rule without constraints
    /// never matches — the broker refuses constraint-free tokens anyway.
    pub fn constraints(&self) -> Option<&Value> {
        self.constraints.as_ref().filter(|c| !c.is_null())
    }
}

/// A signed, session-scoped, tool-scoped, time-bounded grant.
///
/// Binds `(session_id, subject, tool, constraints, iat, exp)`. The signature
/// covers every other field through the canonical JSON form, so mutating any
/// of them — constraints included — invalidates the token. Tokens are
/// consumed once by the broker and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub cap_id: CapId,
    pub session_id: SessionId,
    pub subject: String,
    pub tool: String,
    pub constraints: Value,
    /// Issue time, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds; always > `iat`.
    pub exp: i64,
    /// `"{iat}-{cap_id}"`, unique per token.
    pub nonce: String,
    /// Base64 (standard, padded) HMAC-SHA-256 over the canonical payload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}
