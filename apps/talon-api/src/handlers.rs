//! `/v1/*` request handlers.
//!
//! The HTTP layer only reports errors about the request itself — auth,
//! parsing, unknown ids. Execution failures never surface here; they become
//! recorded steps and a terminal `failed` run status observed by polling.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use talon_audit::{AuditFilter, replay, validate_chain};
use talon_policy::PolicyEngine;
use talon_protocol::event::kind;
use talon_protocol::{
    AuditDraft, Message, Role, Run, RuleOverride, RunId, Session, SessionId, ToolIntent,
};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    label: String,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    intents: Vec<ToolIntent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PutPolicyRequest {
    #[serde(default)]
    overrides: Vec<RuleOverride>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EffectivePolicyQuery {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    until: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ValidateAuditQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

// POST /v1/sessions
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let Json(body) = payload.map_err(|_| ApiError::invalid_json())?;
    let session = state.store.create_session(body.label, body.metadata);
    emit_session_created(&state, &session).await;
    Ok((StatusCode::CREATED, Json(session)))
}

// GET /v1/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let limit = clamp_limit(query.limit, 50, 200);
    Json(json!({"sessions": state.store.list_sessions(limit)}))
}

// GET /v1/sessions/{id}
pub async fn get_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Session>> {
    let session_id = parse_session_id(&id)?;
    let session = require_session(&state, &session_id)?;
    Ok(Json(session))
}

// POST /v1/sessions/{id}/messages — appends the message, creates a queued
// run, and hands it to the executor fire-and-forget. 202 with the run id;
// the outcome is observed by polling the run resource.
pub async fn post_message(
    Path(id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<PostMessageRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let session_id = parse_session_id(&id)?;
    require_session(&state, &session_id)?;
    let Json(body) = payload.map_err(|_| ApiError::invalid_json())?;

    let role = body.role.unwrap_or(Role::User);
    let message = state
        .store
        .append_message(&session_id, role, body.content, body.metadata)
        .ok_or_else(|| ApiError::internal("Failed to append message"))?;
    let run = state.store.create_run(&session_id);
    state.store.set_message_run_id(&session_id, &run.id);
    emit_message_appended(&state, &session_id, &message, &run.id).await;
    emit_run_started(&state, &run).await;

    let executor = state.executor.clone();
    let spawn_session = session_id.clone();
    let spawn_run = run.id.clone();
    let intents = body.intents;
    tokio::spawn(async move {
        executor.run(spawn_session, spawn_run, intents).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"run_id": run.id, "status": run.status})),
    ))
}

// GET /v1/sessions/{id}/messages
pub async fn list_messages(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let session_id = parse_session_id(&id)?;
    let limit = clamp_limit(query.limit, 200, 500);
    let messages = state.store.messages(&session_id, limit).ok_or_else(|| {
        ApiError::not_found("Session not found")
            .with_details(json!({"session_id": session_id.as_str()}))
    })?;
    Ok(Json(json!({"messages": messages})))
}

// PUT /v1/sessions/{id}/policy
pub async fn put_session_policy(
    Path(id): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<PutPolicyRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let session_id = parse_session_id(&id)?;
    require_session(&state, &session_id)?;
    let Json(body) = payload.map_err(|_| ApiError::invalid_json())?;
    state
        .policy
        .set_session_policy(&session_id, body.overrides)
        .await;
    Ok(Json(json!({"ok": true})))
}

// GET /v1/policy/effective?session_id=...
pub async fn get_effective_policy(
    State(state): State<AppState>,
    Query(query): Query<EffectivePolicyQuery>,
) -> ApiResult<Json<Value>> {
    let mut overrides = Vec::new();
    if let Some(raw) = query.session_id.filter(|s| !s.is_empty()) {
        let session_id = parse_session_id(&raw)?;
        require_session(&state, &session_id)?;
        overrides = state.policy.session_policy(&session_id).await;
    }
    Ok(Json(json!({"default": "deny", "overrides": overrides})))
}

// GET /v1/runs/{run_id}
pub async fn get_run(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Run>> {
    let run_id = parse_run_id(&id)?;
    let run = state.store.run(&run_id).ok_or_else(|| {
        ApiError::not_found("Run not found").with_details(json!({"run_id": run_id.as_str()}))
    })?;
    Ok(Json(run))
}

// POST /v1/runs/{run_id}/replay — safe replay: timeline straight from the
// audit log, no tool re-execution.
pub async fn post_run_replay(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let run_id = parse_run_id(&id)?;
    let (events, valid) = replay(state.audit.as_ref(), &run_id)
        .await
        .map_err(ApiError::internal)?;
    let timeline: Vec<Value> = events
        .iter()
        .map(|event| {
            json!({
                "ts": event.ts,
                "type": event.kind,
                "data": event.data,
                "hash": event.hash,
                "prev_hash": event.prev_hash,
            })
        })
        .collect();
    Ok(Json(json!({
        "run_id": run_id,
        "mode": "safe",
        "valid": valid,
        "events": timeline,
    })))
}

// GET /v1/replay?run_id=...
pub async fn get_replay(
    State(state): State<AppState>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<Json<Value>> {
    let raw = query
        .run_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::invalid_request("run_id required"))?;
    let run_id = parse_run_id(&raw)?;
    let (events, valid) = replay(state.audit.as_ref(), &run_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({"run_id": run_id, "valid": valid, "events": events})))
}

// GET /v1/audit
pub async fn query_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Value>> {
    let filter = AuditFilter {
        session_id: query.session_id.filter(|s| !s.is_empty()),
        run_id: query.run_id.filter(|s| !s.is_empty()),
        since: query.since.filter(|s| !s.is_empty()),
        until: query.until.filter(|s| !s.is_empty()),
        kind: query.kind.filter(|s| !s.is_empty()),
        limit: clamp_limit(query.limit, 500, 1000),
    };
    let events = state
        .audit
        .query(&filter)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({"events": events, "next_cursor": null})))
}

// GET /v1/audit/validate
pub async fn validate_audit(
    State(state): State<AppState>,
    Query(query): Query<ValidateAuditQuery>,
) -> ApiResult<Json<Value>> {
    let filter = AuditFilter {
        session_id: query.session_id.filter(|s| !s.is_empty()),
        limit: clamp_limit(query.limit, 500, 1000),
        ..AuditFilter::default()
    };
    let events = state
        .audit
        .query(&filter)
        .await
        .map_err(ApiError::internal)?;
    let invalid_index = validate_chain(&events).map(|i| i as i64).unwrap_or(-1);
    Ok(Json(json!({
        "valid": invalid_index < 0,
        "invalid_index": invalid_index,
        "event_count": events.len(),
    })))
}

// GET /v1/skills — reserved stub until the skills registry is wired.
pub async fn list_skills() -> Json<Value> {
    Json(json!({"skills": []}))
}

// POST /v1/skills — reserved stub.
pub async fn register_skill(
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let _ = payload.map_err(|_| ApiError::invalid_json())?;
    Ok((StatusCode::CREATED, Json(json!({"ok": true}))))
}

async fn emit_session_created(state: &AppState, session: &Session) {
    let draft = AuditDraft::new(
        session.id.clone(),
        kind::SESSION_CREATED,
        json!({
            "label": session.label,
            "status": session.status,
            "metadata": session.metadata,
        }),
    );
    emit(state, draft).await;
}

async fn emit_message_appended(
    state: &AppState,
    session_id: &SessionId,
    message: &Message,
    run_id: &RunId,
) {
    let draft = AuditDraft::for_run(
        session_id.clone(),
        run_id.clone(),
        kind::MESSAGE_APPENDED,
        json!({
            "message_id": message.id,
            "role": message.role,
            "content": message.content,
            "run_id": run_id,
        }),
    );
    emit(state, draft).await;
}

async fn emit_run_started(state: &AppState, run: &Run) {
    let draft = AuditDraft::for_run(
        run.session_id.clone(),
        run.id.clone(),
        kind::RUN_STARTED,
        json!({"status": run.status}),
    );
    emit(state, draft).await;
}

async fn emit(state: &AppState, draft: AuditDraft) {
    if let Err(error) = state.audit.append(draft).await {
        warn!(%error, "failed to append lifecycle audit event");
    }
}

fn require_session(state: &AppState, session_id: &SessionId) -> ApiResult<Session> {
    state.store.session(session_id).ok_or_else(|| {
        ApiError::not_found("Session not found")
            .with_details(json!({"session_id": session_id.as_str()}))
    })
}

fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    match requested {
        Some(n) if n > 0 && n <= max => n,
        _ => default,
    }
}

fn valid_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_session_id(raw: &str) -> ApiResult<SessionId> {
    if !valid_id(raw) {
        return Err(ApiError::invalid_id("Invalid session id"));
    }
    Ok(SessionId::from_string(raw))
}

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    if !valid_id(raw) {
        return Err(ApiError::invalid_id("Invalid run id"));
    }
    Ok(RunId::from_string(raw))
}

#[cfg(test)]
mod tests {
    use std::path::{Path as StdPath, PathBuf};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use tokio::fs;

    use talon_audit::FileAuditLog;
    use talon_broker::CapabilityBroker;
    use talon_executor::RunExecutor;
    use talon_policy::{CapabilityPolicyEngine, Issuer, Verifier};
    use talon_protocol::RunStatus;
    use talon_store::MemoryStore;

    use super::*;

    const ADMIN: &str = "test-admin-token";

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn test_state(root: &StdPath) -> AppState {
        let store = Arc::new(MemoryStore::new());
        let policy = Arc::new(CapabilityPolicyEngine::new(Issuer::new(ADMIN)));
        let broker = Arc::new(CapabilityBroker::new(Verifier::new(ADMIN)));
        let audit = Arc::new(
            FileAuditLog::open(root.join("audit"))
                .await
                .expect("audit log"),
        );
        let executor = Arc::new(RunExecutor::new(
            store.clone(),
            policy.clone(),
            broker,
            audit.clone(),
        ));
        AppState {
            store,
            policy,
            audit,
            executor,
            admin_token: ADMIN.to_owned(),
        }
    }

    async fn wait_terminal(state: &AppState, run_id: &RunId) -> Run {
        for _ in 0..200 {
            if let Some(run) = state.store.run(run_id)
                && run.status.is_terminal()
            {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never reached a terminal status");
    }

    #[test]
    fn limits_clamp_to_their_caps() {
        assert_eq!(clamp_limit(None, 50, 200), 50);
        assert_eq!(clamp_limit(Some(0), 50, 200), 50);
        assert_eq!(clamp_limit(Some(7), 50, 200), 7);
        assert_eq!(clamp_limit(Some(1000), 50, 200), 50);
    }

    #[test]
    fn id_validation_rejects_path_noise() {
        assert!(valid_id("sess_00aabbccddeeff11"));
        assert!(!valid_id(""));
        assert!(!valid_id("sess/../etc"));
        assert!(parse_run_id("run 1").is_err());
    }

    #[tokio::test]
    async fn create_get_and_list_sessions() {
        let root = unique_test_root("talon-api-sessions");
        let state = test_state(&root).await;

        let (status, Json(session)) = create_session(
            State(state.clone()),
            Ok(Json(CreateSessionRequest {
                label: "demo".to_owned(),
                metadata: None,
            })),
        )
        .await
        .expect("create session");
        assert_eq!(status, StatusCode::CREATED);

        let Json(fetched) = get_session(
            Path(session.id.as_str().to_owned()),
            State(state.clone()),
        )
        .await
        .expect("get session");
        assert_eq!(fetched.label, "demo");

        let Json(listing) =
            list_sessions(State(state.clone()), Query(ListQuery::default())).await;
        assert_eq!(listing["sessions"].as_array().unwrap().len(), 1);

        let error = get_session(Path("sess_missing00000000".to_owned()), State(state.clone()))
            .await
            .expect_err("unknown session");
        assert_eq!(error.code, "NOT_FOUND");

        let error = get_session(Path("../etc".to_owned()), State(state))
            .await
            .expect_err("bad id");
        assert_eq!(error.code, "INVALID_ID");

        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_json() {
        let root = unique_test_root("talon-api-badjson");
        let state = test_state(&root).await;
        // A rejection from the Json extractor maps to INVALID_JSON; build one
        // via the error path directly since rejections cannot be constructed.
        let error = ApiError::invalid_json();
        assert_eq!(error.code, "INVALID_JSON");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        drop(state);
        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn posted_message_starts_a_run_and_denied_shell_fails_it() {
        let root = unique_test_root("talon-api-shell");
        let state = test_state(&root).await;
        let session = state.store.create_session("s".to_owned(), None);

        let (status, Json(accepted)) = post_message(
            Path(session.id.as_str().to_owned()),
            State(state.clone()),
            Ok(Json(PostMessageRequest {
                role: None,
                content: "run the shell".to_owned(),
                metadata: None,
                intents: vec![ToolIntent::new("shell.exec", json!({}))],
            })),
        )
        .await
        .expect("post message");
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted["status"], "queued");

        let run_id = RunId::from_string(accepted["run_id"].as_str().unwrap());
        let run = wait_terminal(&state, &run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps.len(), 1);

        // The triggering message carries the run id.
        let Json(messages) = list_messages(
            Path(session.id.as_str().to_owned()),
            State(state.clone()),
            Query(ListQuery::default()),
        )
        .await
        .expect("list messages");
        let messages = messages["messages"].as_array().unwrap().clone();
        assert_eq!(messages[0]["run_id"], json!(run_id.as_str()));
        // Executor appended the assistant summary after the user message.
        assert_eq!(messages.last().unwrap()["role"], "assistant");

        // Audit trail: lifecycle events from the API plus the executor's.
        let Json(audit) = query_audit(
            State(state.clone()),
            Query(AuditQuery {
                session_id: Some(session.id.as_str().to_owned()),
                ..AuditQuery::default()
            }),
        )
        .await
        .expect("query audit");
        let kinds: Vec<&str> = audit["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "message.appended",
                "run.started",
                "policy.intent.received",
                "policy.decision",
                "run.finished",
            ]
        );

        let Json(validation) = validate_audit(
            State(state.clone()),
            Query(ValidateAuditQuery::default()),
        )
        .await
        .expect("validate audit");
        assert_eq!(validation["valid"], true);
        assert_eq!(validation["invalid_index"], -1);

        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn policy_put_then_effective_roundtrip() {
        let root = unique_test_root("talon-api-policy");
        let state = test_state(&root).await;
        let session = state.store.create_session("p".to_owned(), None);

        let Json(ok) = put_session_policy(
            Path(session.id.as_str().to_owned()),
            State(state.clone()),
            Ok(Json(PutPolicyRequest {
                overrides: vec![RuleOverride {
                    tool: "file.read".to_owned(),
                    allow: true,
                    constraints: Some(json!({"roots": ["/work"], "max_bytes": 1024})),
                }],
            })),
        )
        .await
        .expect("put policy");
        assert_eq!(ok["ok"], true);

        let Json(effective) = get_effective_policy(
            State(state.clone()),
            Query(EffectivePolicyQuery {
                session_id: Some(session.id.as_str().to_owned()),
            }),
        )
        .await
        .expect("effective policy");
        assert_eq!(effective["default"], "deny");
        assert_eq!(effective["overrides"][0]["tool"], "file.read");

        let error = put_session_policy(
            Path("sess_unknown12345678".to_owned()),
            State(state.clone()),
            Ok(Json(PutPolicyRequest::default())),
        )
        .await
        .expect_err("unknown session");
        assert_eq!(error.code, "NOT_FOUND");

        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn replay_shapes_for_get_and_post() {
        let root = unique_test_root("talon-api-replay");
        let state = test_state(&root).await;
        let session = state.store.create_session("r".to_owned(), None);

        let (_, Json(accepted)) = post_message(
            Path(session.id.as_str().to_owned()),
            State(state.clone()),
            Ok(Json(PostMessageRequest {
                role: None,
                content: "hello".to_owned(),
                metadata: None,
                intents: Vec::new(),
            })),
        )
        .await
        .expect("post message");
        let run_id = RunId::from_string(accepted["run_id"].as_str().unwrap());
        wait_terminal(&state, &run_id).await;

        let Json(timeline) = post_run_replay(
            Path(run_id.as_str().to_owned()),
            State(state.clone()),
        )
        .await
        .expect("post replay");
        assert_eq!(timeline["mode"], "safe");
        assert_eq!(timeline["valid"], true);
        let events = timeline["events"].as_array().unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.get("hash").is_some()));

        let Json(raw) = get_replay(
            State(state.clone()),
            Query(ReplayQuery {
                run_id: Some(run_id.as_str().to_owned()),
            }),
        )
        .await
        .expect("get replay");
        assert_eq!(raw["valid"], true);
        assert_eq!(
            raw["events"].as_array().unwrap().len(),
            events.len()
        );

        let error = get_replay(State(state.clone()), Query(ReplayQuery::default()))
            .await
            .expect_err("missing run_id");
        assert_eq!(error.code, "INVALID_REQUEST");

        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn skills_stubs_answer() {
        let Json(skills) = list_skills().await;
        assert_eq!(skills["skills"], json!([]));

        let (status, Json(ok)) = register_skill(Ok(Json(json!({"name": "indexer"}))))
            .await
            .expect("register skill");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(ok["ok"], true);
    }
}
