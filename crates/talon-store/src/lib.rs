//! # talon-store — in-memory session, message, and run state
//!
//! Three mappings behind one reader/writer lock. Read paths take the shared
//! lock, every mutation takes the exclusive lock; messages are kept as an
//! ordered sequence per session. Sessions are never deleted.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use talon_protocol::{
    Message, MessageId, Role, Run, RunId, RunStatus, Session, SessionId, SessionStatus, Step,
};

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    messages: HashMap<SessionId, Vec<Message>>,
    runs: HashMap<RunId, Run>,
}

/// Thread-safe in-memory store shared by the HTTP layer and the executor.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(
        &self,
        label: String,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Session {
        let session = Session {
            id: SessionId::new(),
            created_at: Utc::now(),
            label,
            status: SessionStatus::Active,
            metadata,
        };
        let mut state = self.state.write();
        state.messages.insert(session.id.clone(), Vec::new());
        state
            .sessions
            .insert(session.id.clone(), session.clone());
        session
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.state.read().sessions.get(id).cloned()
    }

    /// Sessions ordered newest first, truncated to `limit` (defaulting to 50
    /// for non-positive values).
    pub fn list_sessions(&self, limit: usize) -> Vec<Session> {
        let limit = if limit == 0 { 50 } else { limit };
        let mut sessions: Vec<Session> =
            self.state.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions.truncate(limit);
        sessions
    }

    /// Append a message to a session. Returns `None` for unknown sessions.
    pub fn append_message(
        &self,
        session_id: &SessionId,
        role: Role,
        content: String,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Option<Message> {
        let mut state = self.state.write();
        if !state.sessions.contains_key(session_id) {
            return None;
        }
        let message = Message {
            id: MessageId::new(),
            role,
            content,
            timestamp: Utc::now(),
            metadata,
            run_id: None,
        };
        state
            .messages
            .entry(session_id.clone())
            .or_default()
            .push(message.clone());
        Some(message)
    }

    /// Mark the session's last message as the trigger of `run_id`.
    pub fn set_message_run_id(&self, session_id: &SessionId, run_id: &RunId) {
        let mut state = self.state.write();
        if let Some(messages) = state.messages.get_mut(session_id)
            && let Some(last) = messages.last_mut()
        {
            last.run_id = Some(run_id.clone());
        }
    }

    /// The most recent `limit` messages in order (default 200 for
    /// non-positive values). `None` for unknown sessions.
    pub fn messages(&self, session_id: &SessionId, limit: usize) -> Option<Vec<Message>> {
        let limit = if limit == 0 { 200 } else { limit };
        let state = self.state.read();
        let messages = state.messages.get(session_id)?;
        let start = messages.len().saturating_sub(limit);
        Some(messages[start..].to_vec())
    }

    pub fn last_message(&self, session_id: &SessionId) -> Option<Message> {
        self.state.read().messages.get(session_id)?.last().cloned()
    }

    /// Create a run in the `queued` state.
    pub fn create_run(&self, session_id: &SessionId) -> Run {
        let run = Run {
            id: RunId::new(),
            session_id: session_id.clone(),
            status: RunStatus::Queued,
            started_at: Utc::now(),
            ended_at: None,
            steps: Vec::new(),
        };
        self.state.write().runs.insert(run.id.clone(), run.clone());
        run
    }

    pub fn run(&self, id: &RunId) -> Option<Run> {
        self.state.read().runs.get(id).cloned()
    }

    pub fn update_run_status(&self, id: &RunId, status: RunStatus) {
        let mut state = self.state.write();
        if let Some(run) = state.runs.get_mut(id) {
            run.status = status;
            if status.is_terminal() {
                run.ended_at = Some(Utc::now());
            }
        }
    }

    pub fn append_run_step(&self, id: &RunId, step: Step) {
        let mut state = self.state.write();
        if let Some(run) = state.runs.get_mut(id) {
            run.steps.push(step);
        }
    }
}
