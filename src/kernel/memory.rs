//! Memory gate and store — the only door into the agent's memory.
//!
//! Every candidate fact is scored, then committed, quarantined, or rejected.
//! Rejected candidates are never persisted. Quarantined entries stay on disk
//! but are hidden from default retrieval until an operator rehabilitates
//! them. Duplicate detection uses a SHA-256 content hash scoped to the
//! entry's kind. The gate emits exactly one `memory.committed` or
//! `memory.quarantined` event per admit that did not reject.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::kernel::event_store::EventStore;
use crate::kernel::journal::Journal;
use crate::kernel::trust::TrustScorer;
use crate::types::{EventKind, MemoryCandidate, MemoryEntry, MemoryState, TrustTier};

/// Memory gate errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// No entry with this ID.
    #[error("memory entry not found: {0}")]
    NotFound(Uuid),
    /// The entry is not in the state the operation requires.
    #[error("memory entry {id} is {state}, expected {expected}")]
    Conflict {
        id: Uuid,
        state: MemoryState,
        expected: MemoryState,
    },
}

/// Result of offering a candidate to the gate.
#[derive(Debug, Clone)]
pub struct AdmitOutcome {
    /// Assigned entry ID; `None` when the candidate was rejected.
    pub id: Option<Uuid>,
    pub state: MemoryState,
    pub reason: String,
    /// Trust tier the candidate scored.
    pub tier: TrustTier,
}

/// Options for [`MemoryGate::retrieve`].
#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    /// Also return quarantined entries.
    pub include_quarantined: bool,
    /// Drop entries below this tier.
    pub min_tier: TrustTier,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            include_quarantined: false,
            min_tier: TrustTier::Low,
        }
    }
}

struct Store {
    entries: HashMap<Uuid, MemoryEntry>,
    /// (kind, content hash) of active committed entries, for duplicate
    /// detection.
    active_hashes: HashMap<(String, String), Uuid>,
}

/// Gatekeeper and store for agent memory.
pub struct MemoryGate {
    scorer: TrustScorer,
    admit_tier: TrustTier,
    store: Mutex<Store>,
    events: Arc<EventStore>,
    journal: Option<Arc<Journal>>,
}

impl std::fmt::Debug for MemoryGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.store.lock().map(|s| s.entries.len()).unwrap_or(0);
        f.debug_struct("MemoryGate")
            .field("admit_tier", &self.admit_tier)
            .field("entry_count", &len)
            .finish()
    }
}

impl MemoryGate {
    /// Create a gate with the given scorer and admission tier.
    pub fn new(scorer: TrustScorer, admit_tier: TrustTier, events: Arc<EventStore>) -> Self {
        Self {
            scorer,
            admit_tier,
            store: Mutex::new(Store {
                entries: HashMap::new(),
                active_hashes: HashMap::new(),
            }),
            events,
            journal: None,
        }
    }

    /// Attach the journal so entries and state changes persist.
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Minimum tier a candidate needs to be committed.
    pub fn admit_tier(&self) -> TrustTier {
        self.admit_tier
    }

    /// Reload entries from the journal at startup, rebuilding the duplicate
    /// index from active committed entries. Emits no events.
    pub fn restore(&self, entries: Vec<MemoryEntry>) {
        let mut store = self.lock_store();
        for entry in entries {
            if entry.state == MemoryState::Committed && entry.superseded_by.is_none() {
                let key = (entry.kind.clone(), content_hash(&entry.kind, &entry.content));
                store.active_hashes.insert(key, entry.id);
            }
            store.entries.insert(entry.id, entry);
        }
    }

    /// Score a candidate and admit, quarantine, or reject it.
    pub fn admit(&self, candidate: MemoryCandidate) -> AdmitOutcome {
        let mut store = self.lock_store();
        self.admit_locked(&mut store, candidate, None)
    }

    /// Atomically replace `old_id` with a new candidate.
    ///
    /// The old entry is only marked superseded if the new candidate is
    /// persisted (committed or quarantined); a rejected candidate leaves the
    /// store untouched.
    pub fn supersede(
        &self,
        old_id: Uuid,
        candidate: MemoryCandidate,
    ) -> Result<AdmitOutcome, MemoryError> {
        let mut store = self.lock_store();
        if !store.entries.contains_key(&old_id) {
            return Err(MemoryError::NotFound(old_id));
        }

        let outcome = self.admit_locked(&mut store, candidate, Some(old_id));
        if let Some(new_id) = outcome.id {
            let old_key = store.entries.get_mut(&old_id).map(|old| {
                old.superseded_by = Some(new_id);
                (old.kind.clone(), content_hash(&old.kind, &old.content))
            });
            // Drop the old duplicate-index entry unless the replacement
            // reused the same content hash.
            if let Some(key) = old_key {
                if store.active_hashes.get(&key) == Some(&old_id) {
                    store.active_hashes.remove(&key);
                }
            }
            if let Some(old) = store.entries.get(&old_id) {
                let snapshot = old.clone();
                self.persist_entry(&snapshot);
            }
        }
        Ok(outcome)
    }

    /// Retrieve entries ranked by (tier desc, recency desc).
    ///
    /// Quarantined entries never appear unless `include_quarantined` is set;
    /// superseded entries never appear at all. `min_tier` applies to every
    /// returned entry, quarantined or not. A non-empty query filters by
    /// case-insensitive substring match on content.
    pub fn retrieve(&self, query: &str, opts: RetrieveOptions) -> Vec<MemoryEntry> {
        let store = self.lock_store();
        let needle = query.to_lowercase();

        let mut matches: Vec<MemoryEntry> = store
            .entries
            .values()
            .filter(|e| match e.state {
                MemoryState::Committed => true,
                MemoryState::Quarantined => opts.include_quarantined,
                MemoryState::Draft | MemoryState::Rejected => false,
            })
            .filter(|e| e.superseded_by.is_none())
            .filter(|e| e.trust.tier >= opts.min_tier)
            .filter(|e| needle.is_empty() || e.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            b.trust
                .tier
                .cmp(&a.trust.tier)
                .then(b.created_at.cmp(&a.created_at))
        });
        matches
    }

    /// Move a quarantined entry to committed.
    pub fn rehabilitate(&self, id: Uuid) -> Result<MemoryEntry, MemoryError> {
        let mut store = self.lock_store();
        let entry = store
            .entries
            .get_mut(&id)
            .ok_or(MemoryError::NotFound(id))?;
        if entry.state != MemoryState::Quarantined {
            return Err(MemoryError::Conflict {
                id,
                state: entry.state,
                expected: MemoryState::Quarantined,
            });
        }

        entry.state = MemoryState::Committed;
        let snapshot = entry.clone();
        let key = (
            snapshot.kind.clone(),
            content_hash(&snapshot.kind, &snapshot.content),
        );
        store.active_hashes.insert(key, id);
        self.persist_entry(&snapshot);

        info!(id = %id, "memory entry rehabilitated");
        self.events.append(
            EventKind::MemoryCommitted,
            None,
            serde_json::json!({
                "id": id,
                "kind": snapshot.kind,
                "tier": snapshot.trust.tier,
                "rehabilitated": true,
            }),
        );
        Ok(snapshot)
    }

    /// Move a committed entry to quarantine (operator action, or the
    /// pipeline backing out a commit that failed invariant checks).
    pub fn quarantine(&self, id: Uuid) -> Result<MemoryEntry, MemoryError> {
        let mut store = self.lock_store();
        let entry = store
            .entries
            .get_mut(&id)
            .ok_or(MemoryError::NotFound(id))?;
        if entry.state != MemoryState::Committed {
            return Err(MemoryError::Conflict {
                id,
                state: entry.state,
                expected: MemoryState::Committed,
            });
        }

        entry.state = MemoryState::Quarantined;
        let snapshot = entry.clone();
        let key = (
            snapshot.kind.clone(),
            content_hash(&snapshot.kind, &snapshot.content),
        );
        store.active_hashes.remove(&key);
        self.persist_entry(&snapshot);

        self.events.append(
            EventKind::MemoryQuarantined,
            None,
            serde_json::json!({
                "id": id,
                "kind": snapshot.kind,
                "tier": snapshot.trust.tier,
                "demoted": true,
            }),
        );
        Ok(snapshot)
    }

    /// IDs currently in quarantine.
    pub fn quarantine_list(&self) -> Vec<Uuid> {
        let store = self.lock_store();
        let mut ids: Vec<Uuid> = store
            .entries
            .values()
            .filter(|e| e.state == MemoryState::Quarantined)
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    /// Fetch one entry regardless of state.
    pub fn get(&self, id: Uuid) -> Option<MemoryEntry> {
        self.lock_store().entries.get(&id).cloned()
    }

    /// Snapshot of committed entries, for the invariant checker.
    pub fn committed_entries(&self) -> Vec<MemoryEntry> {
        self.lock_store()
            .entries
            .values()
            .filter(|e| e.state == MemoryState::Committed)
            .cloned()
            .collect()
    }

    fn admit_locked(
        &self,
        store: &mut Store,
        candidate: MemoryCandidate,
        supersedes: Option<Uuid>,
    ) -> AdmitOutcome {
        let now = Utc::now();
        let trust = self.scorer.score(&candidate, now);
        let tier = trust.tier;

        let hash_key = (
            candidate.kind.clone(),
            content_hash(&candidate.kind, &candidate.content),
        );
        let duplicate_of = store.active_hashes.get(&hash_key).copied();

        let state = if tier == TrustTier::Quarantine {
            MemoryState::Rejected
        } else if tier < self.admit_tier {
            MemoryState::Quarantined
        } else if duplicate_of.is_some_and(|id| Some(id) != supersedes) {
            MemoryState::Rejected
        } else {
            MemoryState::Committed
        };

        match state {
            MemoryState::Rejected => {
                let reason = if tier == TrustTier::Quarantine {
                    format!("trust tier {tier} below quarantine cutoff")
                } else {
                    format!(
                        "active duplicate {} in kind '{}'",
                        duplicate_of.map(|id| id.to_string()).unwrap_or_default(),
                        candidate.kind
                    )
                };
                debug!(kind = %candidate.kind, %reason, "memory candidate rejected");
                AdmitOutcome {
                    id: None,
                    state,
                    reason,
                    tier,
                }
            }
            MemoryState::Committed | MemoryState::Quarantined => {
                let id = Uuid::new_v4();
                let entry = MemoryEntry {
                    id,
                    kind: candidate.kind,
                    content: candidate.content,
                    embedding: candidate.embedding,
                    source: candidate.source,
                    trust,
                    state,
                    created_at: now,
                    supersedes,
                    superseded_by: None,
                };

                if state == MemoryState::Committed {
                    store.active_hashes.insert(hash_key, id);
                }
                store.entries.insert(id, entry.clone());
                self.persist_entry(&entry);

                let (kind, reason) = if state == MemoryState::Committed {
                    (EventKind::MemoryCommitted, format!("tier {tier} admitted"))
                } else {
                    (
                        EventKind::MemoryQuarantined,
                        format!("tier {tier} below admit tier {}", self.admit_tier),
                    )
                };
                info!(id = %id, state = %state, tier = %tier, "memory candidate admitted");
                self.events.append(
                    kind,
                    None,
                    serde_json::json!({
                        "id": id,
                        "kind": entry.kind,
                        "tier": tier,
                        "value": entry.trust.value,
                    }),
                );

                AdmitOutcome {
                    id: Some(id),
                    state,
                    reason,
                    tier,
                }
            }
            MemoryState::Draft => unreachable!("admit never leaves draft state"),
        }
    }

    fn persist_entry(&self, entry: &MemoryEntry) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.upsert_memory_entry(entry) {
                tracing::warn!(id = %entry.id, error = %e, "failed to journal memory entry");
            }
        }
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, Store> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// SHA-256 of kind and content, hex-encoded. Scopes duplicates to a kind.
fn content_hash(kind: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
