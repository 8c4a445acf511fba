//! Session, message, run, and step types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, RunId, SessionId};

/// A conversation/agent session. Created on request; mutated only by message
/// append and policy override; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub label: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// One message in a session, appended in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    /// Set when this message triggered a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One agent run, triggered by one posted message.
///
/// Status transitions exactly `queued -> running -> (completed | failed)`;
/// terminal states set `ended_at`. Steps are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub session_id: SessionId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One atomic record within a run: the policy decision or the tool execution
/// for a single intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// 1-based intent ordinal, `s1`, `s2`, …; shared by the `policy_eval`
    /// and `tool_exec` steps of the same intent.
    pub step_id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub status: StepStatus,
    pub tool: String,
    pub details: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    PolicyEval,
    ToolExec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Allow,
    Denied,
    Ok,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Denied => "denied",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_status_wire_form_is_snake_case() {
        assert_eq!(serde_json::to_string(&RunStatus::Queued).unwrap(), "\"queued\"");
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), "\"failed\"");
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn step_kind_serializes_under_type_key() {
        let step = Step {
            step_id: "s1".to_owned(),
            kind: StepKind::PolicyEval,
            status: StepStatus::Denied,
            tool: "shell.exec".to_owned(),
            details: json!({"reason": "shell disabled by default"}),
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "policy_eval");
        assert_eq!(value["status"], "denied");
        assert_eq!(value["step_id"], "s1");
    }

    #[test]
    fn message_omits_absent_run_id() {
        let message = Message {
            id: MessageId::new(),
            role: Role::User,
            content: "hello".to_owned(),
            timestamp: Utc::now(),
            metadata: None,
            run_id: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("run_id").is_none());
        assert_eq!(value["role"], "user");
    }
}
