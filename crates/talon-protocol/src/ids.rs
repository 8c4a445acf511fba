//! Prefixed ID types.
//!
//! IDs are opaque String wrappers (serde-transparent) carrying a short type
//! prefix followed by 16 hex chars from 8 random bytes, e.g.
//! `sess_a3f09b127cc84e01`. The prefix makes ids self-describing in logs and
//! audit records; consumers only ever need the string form.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random ID with this type's prefix.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, hex::encode(rand::random::<[u8; 8]>())))
            }

            /// Wrap an existing string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

prefixed_id!(
    /// Unique identifier for a session.
    SessionId,
    "sess"
);
prefixed_id!(
    /// Unique identifier for a message within a session.
    MessageId,
    "msg"
);
prefixed_id!(
    /// Unique identifier for a run.
    RunId,
    "run"
);
prefixed_id!(
    /// Unique identifier for an audit event.
    EventId,
    "evt"
);
prefixed_id!(
    /// Unique identifier for a capability token.
    CapId,
    "cap"
);

/// Step id for the 1-based intent ordinal: `s1`, `s2`, …
///
/// The `policy_eval` and `tool_exec` steps for the same intent share one id.
pub fn step_id(ordinal: usize) -> String {
    format!("s{ordinal}")
}
