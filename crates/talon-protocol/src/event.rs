//! Audit event types and the event kind names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, RunId, SessionId};

/// Audit event kind names, as they appear on the wire.
pub mod kind {
    pub const SESSION_CREATED: &str = "session.created";
    pub const MESSAGE_APPENDED: &str = "message.appended";
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const POLICY_INTENT_RECEIVED: &str = "policy.intent.received";
    pub const POLICY_DECISION: &str = "policy.decision";
    pub const CAPABILITY_ISSUED: &str = "capability.issued";
    pub const TOOL_EXECUTED: &str = "tool.executed";
}

/// One entry in the append-only, hash-chained audit log.
///
/// `hash = sha256_hex(prev_hash || canonical_json(event without hash))`.
/// `prev_hash` is the previous entry's hash, or `""` for the first entry in
/// the log, so any retroactive modification propagates detectably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: EventId,
    pub ts: DateTime<Utc>,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub prev_hash: String,
    pub hash: String,
}

/// An event as produced by callers, before the audit log assigns its id,
/// timestamp, and chain position. Only the log turns a draft into a full
/// [`AuditEvent`], which keeps unchained events unrepresentable.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub session_id: SessionId,
    pub run_id: Option<RunId>,
    pub kind: String,
    pub data: Value,
}

impl AuditDraft {
    pub fn new(session_id: SessionId, kind: impl Into<String>, data: Value) -> Self {
        Self {
            session_id,
            run_id: None,
            kind: kind.into(),
            data,
        }
    }

    pub fn for_run(
        session_id: SessionId,
        run_id: RunId,
        kind: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            session_id,
            run_id: Some(run_id),
            kind: kind.into(),
            data,
        }
    }
}
