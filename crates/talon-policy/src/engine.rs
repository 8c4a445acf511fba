//! Deny-by-default evaluation over per-session allowlist overrides.
//!
//! The engine never interprets constraints — it passes the matching
//! override's constraints verbatim into the issued token, and the broker
//! enforces them per tool. That separation keeps policy syntax decoupled
//! from execution semantics.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use talon_protocol::{Decision, PolicyResult, RuleOverride, SessionId, ToolIntent};

use crate::tokens::Issuer;

const DEFAULT_TTL_SECONDS: i64 = 60;

/// Decides ALLOW/DENY for an intent under a session's overrides and issues a
/// capability token on ALLOW.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, intent: &ToolIntent, session_id: &SessionId) -> PolicyResult;

    /// Replace the session's override list atomically.
    async fn set_session_policy(&self, session_id: &SessionId, overrides: Vec<RuleOverride>);

    /// The session's current override list, in declared order.
    async fn session_policy(&self, session_id: &SessionId) -> Vec<RuleOverride>;
}

/// Production engine: a hard deny for `shell.exec`, then the session's
/// overrides in declared order (first allow match wins), then deny.
pub struct CapabilityPolicyEngine {
    default_ttl: i64,
    issuer: Issuer,
    overrides: RwLock<HashMap<String, Vec<RuleOverride>>>,
}

impl CapabilityPolicyEngine {
    pub fn new(issuer: Issuer) -> Self {
        Self {
            default_ttl: DEFAULT_TTL_SECONDS,
            issuer,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    fn allow_with_constraints(
        &self,
        intent: &ToolIntent,
        session_id: &SessionId,
        constraints: Value,
    ) -> PolicyResult {
        match self.issuer.issue(
            session_id,
            intent.subject(),
            &intent.tool,
            constraints,
            self.default_ttl,
        ) {
            Ok(token) => PolicyResult {
                decision: Decision::Allow,
                reason: "matched allowlist".to_owned(),
                suggested_fix: None,
                token: Some(token),
            },
            Err(error) => PolicyResult {
                decision: Decision::Deny,
                reason: format!("failed to issue capability token: {error}"),
                suggested_fix: None,
                token: None,
            },
        }
    }
}

#[async_trait]
impl PolicyEngine for CapabilityPolicyEngine {
    async fn evaluate(&self, intent: &ToolIntent, session_id: &SessionId) -> PolicyResult {
        // shell.exec has no allowlist; overrides cannot re-enable it.
        if intent.tool == "shell.exec" {
            return PolicyResult {
                decision: Decision::Deny,
                reason: "shell disabled by default".to_owned(),
                suggested_fix: Some("Use file.read/file.write or docker.run instead".to_owned()),
                token: None,
            };
        }

        let matched = {
            let overrides = self.overrides.read().await;
            overrides.get(session_id.as_str()).and_then(|rules| {
                rules
                    .iter()
                    .find(|rule| rule.tool == intent.tool && rule.allow)
                    .and_then(|rule| rule.constraints().cloned())
            })
        };

        if let Some(constraints) = matched {
            debug!(tool = %intent.tool, session_id = %session_id, "intent matched allowlist");
            return self.allow_with_constraints(intent, session_id, constraints);
        }

        PolicyResult {
            decision: Decision::Deny,
            reason: "Tool intent denied by policy (no matching allowlist)".to_owned(),
            suggested_fix: Some(
                "Add a session policy override allowing this tool with constraints".to_owned(),
            ),
            token: None,
        }
    }

    async fn set_session_policy(&self, session_id: &SessionId, overrides: Vec<RuleOverride>) {
        self.overrides
            .write()
            .await
            .insert(session_id.as_str().to_owned(), overrides);
    }

    async fn session_policy(&self, session_id: &SessionId) -> Vec<RuleOverride> {
        self.overrides
            .read()
            .await
            .get(session_id.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> CapabilityPolicyEngine {
        CapabilityPolicyEngine::new(Issuer::new("test-secret"))
    }

    fn read_intent(path: &str) -> ToolIntent {
        ToolIntent::new("file.read", json!({"path": path}))
    }

    #[tokio::test]
    async fn denies_by_default_on_empty_policy() {
        let engine = engine();
        let session = SessionId::new();

        let result = engine.evaluate(&read_intent("/work/foo"), &session).await;
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(
            result.reason,
            "Tool intent denied by policy (no matching allowlist)"
        );
        assert!(result.token.is_none());
    }

    #[tokio::test]
    async fn shell_exec_is_denied_even_with_override() {
        let engine = engine();
        let session = SessionId::new();
        engine
            .set_session_policy(
                &session,
                vec![RuleOverride {
                    tool: "shell.exec".to_owned(),
                    allow: true,
                    constraints: Some(json!({})),
                }],
            )
            .await;

        let result = engine
            .evaluate(&ToolIntent::new("shell.exec", json!({})), &session)
            .await;
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.reason, "shell disabled by default");
        assert!(result.token.is_none());
    }

    #[tokio::test]
    async fn override_allows_and_issues_token() {
        let engine = engine();
        let session = SessionId::new();
        engine
            .set_session_policy(
                &session,
                vec![RuleOverride {
                    tool: "file.read".to_owned(),
                    allow: true,
                    constraints: Some(json!({"roots": ["/work/allowed"], "max_bytes": 1024})),
                }],
            )
            .await;

        let result = engine
            .evaluate(&read_intent("/work/allowed/foo"), &session)
            .await;
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.reason, "matched allowlist");

        let token = result.token.expect("allow carries a token");
        assert_eq!(token.tool, "file.read");
        assert_eq!(token.subject, "agent");
        assert_eq!(token.session_id, session);
        assert_eq!(token.constraints["roots"], json!(["/work/allowed"]));
    }

    #[tokio::test]
    async fn first_matching_override_wins() {
        let engine = engine();
        let session = SessionId::new();
        engine
            .set_session_policy(
                &session,
                vec![
                    RuleOverride {
                        tool: "file.read".to_owned(),
                        allow: true,
                        constraints: Some(json!({"roots": ["/first"]})),
                    },
                    RuleOverride {
                        tool: "file.read".to_owned(),
                        allow: true,
                        constraints: Some(json!({"roots": ["/second"]})),
                    },
                ],
            )
            .await;

        let result = engine.evaluate(&read_intent("/first/a"), &session).await;
        let token = result.token.expect("token");
        assert_eq!(token.constraints["roots"], json!(["/first"]));
    }

    #[tokio::test]
    async fn null_constraints_and_deny_entries_are_skipped() {
        let engine = engine();
        let session = SessionId::new();
        engine
            .set_session_policy(
                &session,
                vec![
                    RuleOverride {
                        tool: "file.read".to_owned(),
                        allow: true,
                        constraints: None,
                    },
                    RuleOverride {
                        tool: "file.read".to_owned(),
                        allow: false,
                        constraints: Some(json!({"roots": ["/work"]})),
                    },
                ],
            )
            .await;

        let result = engine.evaluate(&read_intent("/work/foo"), &session).await;
        assert_eq!(result.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn overrides_are_scoped_to_their_session() {
        let engine = engine();
        let granted = SessionId::new();
        let other = SessionId::new();
        engine
            .set_session_policy(
                &granted,
                vec![RuleOverride {
                    tool: "file.read".to_owned(),
                    allow: true,
                    constraints: Some(json!({"roots": ["/work"]})),
                }],
            )
            .await;

        let allowed = engine.evaluate(&read_intent("/work/foo"), &granted).await;
        assert_eq!(allowed.decision, Decision::Allow);

        let denied = engine.evaluate(&read_intent("/work/foo"), &other).await;
        assert_eq!(denied.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn set_session_policy_replaces_previous_list() {
        let engine = engine();
        let session = SessionId::new();
        engine
            .set_session_policy(
                &session,
                vec![RuleOverride {
                    tool: "file.read".to_owned(),
                    allow: true,
                    constraints: Some(json!({"roots": ["/work"]})),
                }],
            )
            .await;
        engine.set_session_policy(&session, vec![]).await;

        let result = engine.evaluate(&read_intent("/work/foo"), &session).await;
        assert_eq!(result.decision, Decision::Deny);
        assert!(engine.session_policy(&session).await.is_empty());
    }
}
