//! # talon-executor — the per-run agent loop
//!
//! Turns one run into a sequence of steps and audit events: for each intent,
//! evaluate policy, execute through the broker when a token was granted, and
//! record both the step and the matching audit events, strictly in intent
//! order. Every failure — denial, token rejection, tool error, even a panic
//! inside the loop — ends as a recorded step plus a terminal `failed` status
//! observable by polling; nothing propagates to the caller.
//!
//! The executor owns no state of its own. It reads and writes through the
//! store and the audit log, and is spawned fire-and-forget by the HTTP layer
//! once per posted message.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use talon_audit::AuditLog;
use talon_broker::ToolBroker;
use talon_policy::PolicyEngine;
use talon_protocol::event::kind;
use talon_protocol::{
    AuditDraft, Decision, Role, RunId, RunStatus, SessionId, Step, StepKind, StepStatus,
    ToolIntent, step_id,
};
use talon_store::MemoryStore;

/// Drives runs to completion. All handles are mandatory at construction, so
/// a half-wired executor is unrepresentable.
pub struct RunExecutor {
    store: Arc<MemoryStore>,
    policy: Arc<dyn PolicyEngine>,
    broker: Arc<dyn ToolBroker>,
    audit: Arc<dyn AuditLog>,
}

impl RunExecutor {
    pub fn new(
        store: Arc<MemoryStore>,
        policy: Arc<dyn PolicyEngine>,
        broker: Arc<dyn ToolBroker>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            store,
            policy,
            broker,
            audit,
        }
    }

    /// Process one run. With an empty `intents` list the intents are parsed
    /// from the session's last message. Unknown runs are ignored — that is a
    /// caller error, not ours to surface.
    #[instrument(skip(self, intents), fields(session_id = %session_id, run_id = %run_id))]
    pub async fn run(&self, session_id: SessionId, run_id: RunId, intents: Vec<ToolIntent>) {
        if self.store.run(&run_id).is_none() {
            debug!("run not found, ignoring");
            return;
        }
        self.store.update_run_status(&run_id, RunStatus::Running);

        let status = match AssertUnwindSafe(self.drive(&session_id, &run_id, intents))
            .catch_unwind()
            .await
        {
            Ok(status) => status,
            Err(_) => {
                warn!("executor loop panicked, marking run failed");
                RunStatus::Failed
            }
        };
        self.finish(&session_id, &run_id, status).await;
    }

    async fn drive(
        &self,
        session_id: &SessionId,
        run_id: &RunId,
        mut intents: Vec<ToolIntent>,
    ) -> RunStatus {
        if intents.is_empty() {
            intents = self.intents_from_last_message(session_id);
        }

        let mut status = RunStatus::Completed;
        for (index, intent) in intents.iter().enumerate() {
            let step = step_id(index + 1);
            self.emit(
                session_id,
                run_id,
                kind::POLICY_INTENT_RECEIVED,
                json!({"tool": intent.tool, "step_id": step}),
            )
            .await;

            let result = self.policy.evaluate(intent, session_id).await;
            self.emit(
                session_id,
                run_id,
                kind::POLICY_DECISION,
                json!({
                    "decision": result.decision.as_str(),
                    "tool": intent.tool,
                    "reason": result.reason,
                    "step_id": step,
                }),
            )
            .await;

            match (result.decision, result.token) {
                (Decision::Allow, Some(token)) => {
                    self.store.append_run_step(
                        run_id,
                        Step {
                            step_id: step.clone(),
                            kind: StepKind::PolicyEval,
                            status: StepStatus::Allow,
                            tool: intent.tool.clone(),
                            details: json!({"reason": result.reason}),
                        },
                    );
                    self.emit(
                        session_id,
                        run_id,
                        kind::CAPABILITY_ISSUED,
                        json!({"token_hash": token.signature, "tool": intent.tool}),
                    )
                    .await;

                    let (step_status, details) =
                        match self.broker.execute(intent, Some(&token)).await {
                            Ok(output) => (StepStatus::Ok, json!({"result": output})),
                            Err(error) => {
                                status = RunStatus::Failed;
                                (StepStatus::Error, json!({"error": error.to_string()}))
                            }
                        };
                    self.store.append_run_step(
                        run_id,
                        Step {
                            step_id: step.clone(),
                            kind: StepKind::ToolExec,
                            status: step_status,
                            tool: intent.tool.clone(),
                            details,
                        },
                    );
                    self.emit(
                        session_id,
                        run_id,
                        kind::TOOL_EXECUTED,
                        json!({
                            "tool": intent.tool,
                            "step_id": step,
                            "status": step_status.as_str(),
                        }),
                    )
                    .await;
                }
                _ => {
                    self.store.append_run_step(
                        run_id,
                        Step {
                            step_id: step.clone(),
                            kind: StepKind::PolicyEval,
                            status: StepStatus::Denied,
                            tool: intent.tool.clone(),
                            details: json!({"reason": result.reason}),
                        },
                    );
                    status = RunStatus::Failed;
                }
            }
        }
        status
    }

    /// Terminal handling: status + `ended_at`, the `run.finished` event, and
    /// the assistant summary message. Runs even after a trapped panic.
    async fn finish(&self, session_id: &SessionId, run_id: &RunId, status: RunStatus) {
        self.store.update_run_status(run_id, status);
        self.emit(
            session_id,
            run_id,
            kind::RUN_FINISHED,
            json!({"status": status.as_str()}),
        )
        .await;

        let step_count = self
            .store
            .run(run_id)
            .map(|run| run.steps.len())
            .unwrap_or(0);
        let summary = format!("Run {run_id} {}. Steps: {step_count}.", status.as_str());
        let metadata = BTreeMap::from([("run_id".to_owned(), run_id.to_string())]);
        self.store
            .append_message(session_id, Role::Assistant, summary, Some(metadata));
    }

    async fn emit(&self, session_id: &SessionId, run_id: &RunId, kind: &str, data: Value) {
        let draft = AuditDraft::for_run(session_id.clone(), run_id.clone(), kind, data);
        if let Err(error) = self.audit.append(draft).await {
            warn!(%error, kind, "failed to append audit event");
        }
    }

    /// Parse intents from the last message: a JSON array of
    /// `{"tool": string, "params": object}`. Anything else yields an empty
    /// list, so the run completes with zero steps. Entries with an empty
    /// tool are skipped; missing params default to `{}`.
    fn intents_from_last_message(&self, session_id: &SessionId) -> Vec<ToolIntent> {
        let Some(message) = self.store.last_message(session_id) else {
            return Vec::new();
        };
        let Ok(entries) = serde_json::from_str::<Vec<Map<String, Value>>>(&message.content) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter_map(|entry| {
                let tool = entry.get("tool").and_then(Value::as_str).unwrap_or("");
                if tool.is_empty() {
                    return None;
                }
                let params = entry
                    .get("params")
                    .and_then(Value::as_object)
                    .cloned()
                    .map(Value::Object)
                    .unwrap_or_else(|| Value::Object(Map::new()));
                Some(ToolIntent::new(tool, params))
            })
            .collect()
    }
}
