//! # talon-protocol — shared contract types
//!
//! This crate defines the types exchanged between the policy engine, the
//! tool broker, the run executor, the audit log, and the HTTP surface.
//!
//! It is intentionally dependency-light (no runtime deps like tokio or axum)
//! so every other crate can use it as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Prefixed ID wrappers (SessionId, RunId, CapId, …) and step ids
//! - [`session`] — Session, Message, Run, Step and their status enums
//! - [`intent`] — ToolIntent, Decision, PolicyResult, RuleOverride, CapabilityToken
//! - [`event`] — AuditEvent, AuditDraft, and the audit event kind names
//! - [`canonical`] — The canonical JSON form used for signing and hashing

pub mod canonical;
pub mod event;
pub mod ids;
pub mod intent;
pub mod session;

pub use canonical::canonical_json;
pub use event::{AuditDraft, AuditEvent};
pub use ids::{CapId, EventId, MessageId, RunId, SessionId, step_id};
pub use intent::{CapabilityToken, Decision, PolicyResult, RuleOverride, ToolIntent};
pub use session::{
    Message, Role, Run, RunStatus, Session, SessionStatus, Step, StepKind, StepStatus,
};
