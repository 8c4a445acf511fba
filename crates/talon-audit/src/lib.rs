//! # talon-audit — tamper-evident audit log
//!
//! Append-only store of audit events over a single JSONL file. Every record
//! carries `hash = sha256_hex(prev_hash || canonical_json(record sans hash))`,
//! so the log forms one hash chain in append order and any retroactive edit
//! is detectable by [`validate_chain`].
//!
//! One async mutex guards both the file append and the advancement of the
//! chain tail — the chain is serialized across concurrent appenders, and
//! queries take the same mutex for a consistent file view.
//!
//! [`replay`] reconstructs a run's timeline purely from the log: a read plus
//! an integrity check, never a re-execution.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use talon_protocol::{AuditDraft, AuditEvent, EventId, RunId, canonical_json};

const LOG_FILE: &str = "audit.jsonl";

/// AND-composed query filters. `limit == 0` means unlimited; `since`/`until`
/// are RFC3339 strings compared lexicographically against each event's
/// second-precision RFC3339 timestamp.
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub session_id: Option<String>,
    pub run_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub kind: Option<String>,
    pub limit: usize,
}

impl AuditFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn for_run(run_id: &RunId) -> Self {
        Self {
            run_id: Some(run_id.as_str().to_owned()),
            ..Self::default()
        }
    }
}

/// The audit sink and query surface. The executor and the HTTP layer only
/// see this trait, so tests can substitute [`NullAuditLog`].
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Seal a draft into the chain: assign id and timestamp, stamp
    /// `prev_hash`, compute the chain hash, persist, and advance the tail.
    async fn append(&self, draft: AuditDraft) -> Result<AuditEvent>;

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>>;
}

struct ChainState {
    prev_hash: String,
}

/// Production log over `{dir}/audit.jsonl` (file 0600, directory 0700).
pub struct FileAuditLog {
    path: PathBuf,
    chain: Mutex<ChainState>,
}

impl FileAuditLog {
    /// Open (or create) the log under `dir`, replaying the existing file to
    /// recover the chain tail. The scan stops at the first undecodable
    /// record rather than failing startup.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&dir)
            .await
            .with_context(|| format!("failed to create audit dir {dir:?}"))?;

        let path = dir.join(LOG_FILE);
        let prev_hash = Self::recover_tail(&path).await?;
        Ok(Self {
            path,
            chain: Mutex::new(ChainState { prev_hash }),
        })
    }

    async fn recover_tail(path: &Path) -> Result<String> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(String::new());
        }
        let file = OpenOptions::new().read(true).open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut tail = String::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => tail = event.hash,
                Err(error) => {
                    warn!(%error, "audit log scan stopped at undecodable record");
                    break;
                }
            }
        }
        Ok(tail)
    }

    async fn read_matching(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new().read(true).open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<AuditEvent>(&line) else {
                break;
            };
            if !matches_filter(&event, filter) {
                continue;
            }
            events.push(event);
            if filter.limit > 0 && events.len() >= filter.limit {
                break;
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl AuditLog for FileAuditLog {
    #[instrument(skip(self, draft), fields(kind = %draft.kind, session_id = %draft.session_id))]
    async fn append(&self, draft: AuditDraft) -> Result<AuditEvent> {
        let mut chain = self.chain.lock().await;

        let mut event = AuditEvent {
            event_id: EventId::new(),
            ts: Utc::now(),
            session_id: draft.session_id,
            run_id: draft.run_id,
            kind: draft.kind,
            data: draft.data,
            prev_hash: chain.prev_hash.clone(),
            hash: String::new(),
        };
        event.hash = chain_hash(&chain.prev_hash, &event)?;

        let line = serde_json::to_string(&event).context("failed serializing audit event")?;
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&self.path)
            .await
            .with_context(|| format!("failed opening audit log {:?}", self.path))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        chain.prev_hash = event.hash.clone();
        debug!(event_id = %event.event_id, "audit event appended");
        Ok(event)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        // Holding the chain lock gives the query a consistent file view.
        let _chain = self.chain.lock().await;
        self.read_matching(filter).await
    }
}

/// Discards appends and answers queries with nothing. For tests that
/// exercise components without caring about the trail.
pub struct NullAuditLog;

#[async_trait]
impl AuditLog for NullAuditLog {
    async fn append(&self, draft: AuditDraft) -> Result<AuditEvent> {
        Ok(AuditEvent {
            event_id: EventId::new(),
            ts: Utc::now(),
            session_id: draft.session_id,
            run_id: draft.run_id,
            kind: draft.kind,
            data: draft.data,
            prev_hash: String::new(),
            hash: String::new(),
        })
    }

    async fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        Ok(Vec::new())
    }
}

fn matches_filter(event: &AuditEvent, filter: &AuditFilter) -> bool {
    if let Some(session_id) = &filter.session_id
        && event.session_id.as_str() != session_id
    {
        return false;
    }
    if let Some(run_id) = &filter.run_id
        && event.run_id.as_ref().map(|r| r.as_str()) != Some(run_id.as_str())
    {
        return false;
    }
    if let Some(kind) = &filter.kind
        && event.kind != *kind
    {
        return false;
    }
    // RFC3339 at fixed precision sorts lexicographically, so plain string
    // comparison implements the time window.
    let ts = event.ts.to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Some(since) = &filter.since
        && ts < *since
    {
        return false;
    }
    if let Some(until) = &filter.until
        && ts > *until
    {
        return false;
    }
    true
}

/// `sha256_hex(prev_hash || canonical_json(event sans hash))`, with the
/// event's `prev_hash` field pinned to `prev_hash` in the hashed form. Used
/// identically at append and validation time.
pub fn chain_hash(prev_hash: &str, event: &AuditEvent) -> Result<String> {
    let mut value = serde_json::to_value(event).context("failed serializing audit event")?;
    if let Some(object) = value.as_object_mut() {
        object.remove("hash");
        object.insert("prev_hash".to_owned(), Value::String(prev_hash.to_owned()));
    }
    let canonical = canonical_json(&value).context("failed canonicalizing audit event")?;
    Ok(sha256_hex(&format!("{prev_hash}{canonical}")))
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Walk a contiguous slice of the chain and return the index of the first
/// event whose hash does not match the recomputed value, or `None` when the
/// slice is internally consistent. The first event's `prev_hash` seeds the
/// walk, so the slice need not start at the log head.
pub fn validate_chain(events: &[AuditEvent]) -> Option<usize> {
    let mut prev = events.first().map(|e| e.prev_hash.clone())?;
    for (index, event) in events.iter().enumerate() {
        let expected = match chain_hash(&prev, event) {
            Ok(hash) => hash,
            Err(_) => return Some(index),
        };
        if event.hash != expected {
            return Some(index);
        }
        prev = event.hash.clone();
    }
    None
}

/// Safe replay: the run's timeline straight from the log plus a chain
/// integrity verdict. No tool execution, no state mutation.
pub async fn replay(log: &dyn AuditLog, run_id: &RunId) -> Result<(Vec<AuditEvent>, bool)> {
    let events = log.query(&AuditFilter::for_run(run_id)).await?;
    let valid = validate_chain(&events).is_none();
    Ok((events, valid))
}
