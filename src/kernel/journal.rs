//! SQLite journal — the kernel's bundled persistence.
//!
//! Five tables, single writer, append-mostly: `events`, `memory_entries`,
//! `goals`, `identity_versions`, `approval_log`. Only `memory_entries.state`
//! and `goals.completed` mutate in place. The journal also implements
//! [`EventSink`] so the event store mirrors every append into the `events`
//! table.
//!
//! Unavailability at startup is fatal (launcher exit code 2); later write
//! failures are logged and surfaced to the orchestrator.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::kernel::event_store::EventSink;
use crate::types::{
    ApprovalPolicy, Event, Goal, IdentityDescriptor, MemoryEntry, MemoryState, TrustScore,
    TrustTier,
};

// ── Errors ──────────────────────────────────────────────────────

/// Journal operation errors.
#[derive(Debug, Error)]
pub enum JournalError {
    /// SQLite database error.
    #[error("database error: {0}")]
    Database(String),
    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for JournalError {
    fn from(e: rusqlite::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Serialization(e.to_string())
    }
}

// ── Types ───────────────────────────────────────────────────────

/// One row of the approval log.
#[derive(Debug, Clone)]
pub struct ApprovalLogRow {
    pub call_id: Uuid,
    pub policy: String,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision: Option<String>,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

// ── SQL Schema ──────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    seq         INTEGER PRIMARY KEY,
    ts          TEXT NOT NULL,
    kind        TEXT NOT NULL,
    episode_id  TEXT,
    payload     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
CREATE INDEX IF NOT EXISTS idx_events_episode ON events(episode_id);

CREATE TABLE IF NOT EXISTS memory_entries (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    content     TEXT NOT NULL,
    embedding   TEXT,
    source      TEXT NOT NULL,
    trust_value REAL NOT NULL,
    trust_tier  TEXT NOT NULL,
    state       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    supersedes  TEXT,
    superseded_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_memory_state ON memory_entries(state);

CREATE TABLE IF NOT EXISTS goals (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    description  TEXT NOT NULL,
    tags         TEXT NOT NULL,
    priority     INTEGER NOT NULL,
    completed    INTEGER NOT NULL,
    completed_at TEXT,
    created_at   TEXT NOT NULL,
    metadata     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_versions (
    version    INTEGER PRIMARY KEY,
    hash       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approval_log (
    call_id      TEXT PRIMARY KEY,
    policy       TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    decided_at   TEXT,
    decision     TEXT,
    actor        TEXT,
    reason       TEXT
);
"#;

/// SQLite-backed journal. All access serializes through one connection.
pub struct Journal {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

impl Journal {
    /// Open (or create) the journal at `path`. `:memory:` gives an
    /// ephemeral journal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let conn = if path.as_ref().to_str() == Some(":memory:") {
            Connection::open_in_memory()?
        } else {
            Connection::open(path.as_ref())?
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Events ──

    /// Append one event row.
    pub fn insert_event(&self, event: &Event) -> Result<(), JournalError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO events (seq, ts, kind, episode_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                i64::try_from(event.seq).unwrap_or(i64::MAX),
                event.ts.to_rfc3339(),
                event.kind.to_string(),
                event.episode_id.map(|id| id.to_string()),
                serde_json::to_string(&event.payload)?,
            ],
        )?;
        Ok(())
    }

    /// Number of persisted events.
    pub fn event_count(&self) -> Result<u64, JournalError> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    // ── Memory entries ──

    /// Insert or update a memory entry row.
    pub fn upsert_memory_entry(&self, entry: &MemoryEntry) -> Result<(), JournalError> {
        let embedding = entry
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO memory_entries
             (id, kind, content, embedding, source, trust_value, trust_tier, state,
              created_at, supersedes, superseded_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.to_string(),
                entry.kind,
                entry.content,
                embedding,
                entry.source,
                entry.trust.value,
                entry.trust.tier.to_string(),
                entry.state.to_string(),
                entry.created_at.to_rfc3339(),
                entry.supersedes.map(|id| id.to_string()),
                entry.superseded_by.map(|id| id.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Load every persisted memory entry.
    ///
    /// Signal breakdowns are not persisted; restored scores carry the stored
    /// value and tier with an empty signal list.
    pub fn load_memory_entries(&self) -> Result<Vec<MemoryEntry>, JournalError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, kind, content, embedding, source, trust_value, trust_tier, state,
                    created_at, supersedes, superseded_by
             FROM memory_entries ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let content: String = row.get(2)?;
            let embedding: Option<String> = row.get(3)?;
            let source: String = row.get(4)?;
            let trust_value: f64 = row.get(5)?;
            let trust_tier: String = row.get(6)?;
            let state: String = row.get(7)?;
            let created_at: String = row.get(8)?;
            let supersedes: Option<String> = row.get(9)?;
            let superseded_by: Option<String> = row.get(10)?;
            Ok((
                id,
                kind,
                content,
                embedding,
                source,
                trust_value,
                trust_tier,
                state,
                created_at,
                supersedes,
                superseded_by,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (
                id,
                kind,
                content,
                embedding,
                source,
                trust_value,
                trust_tier,
                state,
                created_at,
                supersedes,
                superseded_by,
            ) = row?;
            let created_at = parse_ts(&created_at);
            entries.push(MemoryEntry {
                id: parse_uuid(&id)?,
                kind,
                content,
                embedding: embedding
                    .map(|e| serde_json::from_str::<Vec<f32>>(&e))
                    .transpose()?,
                source,
                trust: TrustScore {
                    value: trust_value,
                    tier: parse_tier(&trust_tier),
                    signals: Vec::new(),
                    computed_at: created_at,
                },
                state: parse_state(&state),
                created_at,
                supersedes: supersedes.as_deref().map(parse_uuid).transpose()?,
                superseded_by: superseded_by.as_deref().map(parse_uuid).transpose()?,
            });
        }
        Ok(entries)
    }

    // ── Goals ──

    /// Insert or update a goal row.
    pub fn upsert_goal(&self, goal: &Goal) -> Result<(), JournalError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO goals
             (id, name, description, tags, priority, completed, completed_at, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                goal.id.to_string(),
                goal.name,
                goal.description,
                serde_json::to_string(&goal.tags)?,
                i64::from(goal.priority),
                i64::from(goal.completed),
                goal.completed_at.map(|t| t.to_rfc3339()),
                goal.created_at.to_rfc3339(),
                serde_json::to_string(&goal.metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Load every persisted goal.
    pub fn load_goals(&self) -> Result<Vec<Goal>, JournalError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, tags, priority, completed, completed_at,
                    created_at, metadata
             FROM goals ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: String = row.get(2)?;
            let tags: String = row.get(3)?;
            let priority: i64 = row.get(4)?;
            let completed: i64 = row.get(5)?;
            let completed_at: Option<String> = row.get(6)?;
            let created_at: String = row.get(7)?;
            let metadata: String = row.get(8)?;
            Ok((
                id,
                name,
                description,
                tags,
                priority,
                completed,
                completed_at,
                created_at,
                metadata,
            ))
        })?;

        let mut goals = Vec::new();
        for row in rows {
            let (id, name, description, tags, priority, completed, completed_at, created_at, metadata) =
                row?;
            goals.push(Goal {
                id: parse_uuid(&id)?,
                name,
                description,
                tags: serde_json::from_str(&tags)?,
                priority: u8::try_from(priority).unwrap_or(5),
                completed: completed != 0,
                completed_at: completed_at.as_deref().map(parse_ts),
                created_at: parse_ts(&created_at),
                metadata: serde_json::from_str(&metadata)?,
            });
        }
        Ok(goals)
    }

    // ── Identity ──

    /// Append one identity version.
    pub fn insert_identity_version(
        &self,
        identity: &IdentityDescriptor,
    ) -> Result<(), JournalError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO identity_versions (version, hash, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                i64::from(identity.version),
                identity.hash,
                serde_json::to_string(identity)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Latest persisted identity version, if any.
    pub fn latest_identity(&self) -> Result<Option<IdentityDescriptor>, JournalError> {
        let conn = self.lock_conn();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM identity_versions ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(JournalError::from))
            .transpose()
    }

    // ── Approval log ──

    /// Record a new approval request.
    pub fn insert_approval_request(
        &self,
        call: &crate::types::ToolCall,
        policy: ApprovalPolicy,
    ) -> Result<(), JournalError> {
        let policy = serde_json::to_value(policy)?
            .as_str()
            .unwrap_or("unknown")
            .to_owned();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO approval_log (call_id, policy, requested_at)
             VALUES (?1, ?2, ?3)",
            params![
                call.call_id.to_string(),
                policy,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Record the terminal decision for a request.
    pub fn record_approval_decision(
        &self,
        call_id: Uuid,
        decision: &str,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), JournalError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE approval_log
             SET decided_at = ?2, decision = ?3, actor = ?4, reason = ?5
             WHERE call_id = ?1",
            params![
                call_id.to_string(),
                Utc::now().to_rfc3339(),
                decision,
                actor,
                reason,
            ],
        )?;
        Ok(())
    }

    /// Fetch one approval log row.
    pub fn approval_log_entry(&self, call_id: Uuid) -> Result<Option<ApprovalLogRow>, JournalError> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT call_id, policy, requested_at, decided_at, decision, actor, reason
                 FROM approval_log WHERE call_id = ?1",
                params![call_id.to_string()],
                |row| {
                    let call_id: String = row.get(0)?;
                    let policy: String = row.get(1)?;
                    let requested_at: String = row.get(2)?;
                    let decided_at: Option<String> = row.get(3)?;
                    let decision: Option<String> = row.get(4)?;
                    let actor: Option<String> = row.get(5)?;
                    let reason: Option<String> = row.get(6)?;
                    Ok((call_id, policy, requested_at, decided_at, decision, actor, reason))
                },
            )
            .optional()?;

        row.map(
            |(call_id, policy, requested_at, decided_at, decision, actor, reason)| {
                Ok(ApprovalLogRow {
                    call_id: parse_uuid(&call_id)?,
                    policy,
                    requested_at: parse_ts(&requested_at),
                    decided_at: decided_at.as_deref().map(parse_ts),
                    decision,
                    actor,
                    reason,
                })
            },
        )
        .transpose()
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for Journal {
    fn record(&self, event: &Event) {
        if let Err(e) = self.insert_event(event) {
            warn!(seq = event.seq, error = %e, "failed to journal event");
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, JournalError> {
    Uuid::parse_str(s).map_err(|e| JournalError::Serialization(e.to_string()))
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_tier(s: &str) -> TrustTier {
    s.parse().unwrap_or(TrustTier::Quarantine)
}

fn parse_state(s: &str) -> MemoryState {
    match s {
        "committed" => MemoryState::Committed,
        "quarantined" => MemoryState::Quarantined,
        "draft" => MemoryState::Draft,
        _ => MemoryState::Rejected,
    }
}
