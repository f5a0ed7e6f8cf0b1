//! Approval gate — human-in-the-loop for candidate tool calls.
//!
//! Pending calls wait on a `tokio::sync::oneshot` pair until the operator
//! approves or denies, or the timeout elapses. Two shortcuts resolve without
//! a human: `auto-if-read-only` (contract is read-only and the config switch
//! is on) and `source-trusted` (call source is whitelisted). A shortcut
//! never emits `call.approval_requested`; it emits a synthetic
//! `call.approved` with `auto: true`.
//!
//! On timeout the request resolves as denied with reason `timeout`. A
//! periodic [`ApprovalGate::cleanup_expired`] sweep catches requests whose
//! waiter is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ApprovalSection;
use crate::kernel::event_store::EventStore;
use crate::kernel::journal::Journal;
use crate::types::{ApprovalPolicy, EventKind, ToolCall, ToolContract};

/// Terminal decision for an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Call may proceed. `auto` marks shortcut resolutions.
    Approved { auto: bool, actor: Option<String> },
    /// Call must not proceed.
    Denied {
        reason: String,
        actor: Option<String>,
    },
}

impl ApprovalDecision {
    /// True for either approval form.
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// A request awaiting an operator decision, as shown by `list()`.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub call: ToolCall,
    pub policy: ApprovalPolicy,
    /// Planner-supplied justification surfaced to the operator.
    pub justification: String,
    pub requested_at: DateTime<Utc>,
    pub timeout: Duration,
}

impl PendingApproval {
    /// Whether this request has outlived its timeout at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.requested_at);
        let timeout = chrono::TimeDelta::from_std(self.timeout)
            .unwrap_or_else(|_| chrono::TimeDelta::MAX);
        elapsed > timeout
    }
}

/// Approval gate errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending request with this call ID.
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
}

struct PendingEntry {
    request: PendingApproval,
    sender: oneshot::Sender<ApprovalDecision>,
}

/// Gate holding calls that need a human decision.
pub struct ApprovalGate {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    config: ApprovalSection,
    events: Arc<EventStore>,
    journal: Option<Arc<Journal>>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.pending.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("ApprovalGate")
            .field("pending_count", &count)
            .field("timeout_ms", &self.config.timeout_ms)
            .finish()
    }
}

impl ApprovalGate {
    /// Create a gate with the given config.
    pub fn new(config: ApprovalSection, events: Arc<EventStore>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            config,
            events,
            journal: None,
        }
    }

    /// Attach the journal so the approval log persists.
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Resolve a call's approval, suspending until a decision arrives.
    ///
    /// Auto-approvable calls resolve immediately with a synthetic
    /// `call.approved {auto: true}` and no `call.approval_requested` event.
    pub async fn request(
        &self,
        call: &ToolCall,
        contract: &ToolContract,
        justification: &str,
    ) -> ApprovalDecision {
        let policy = contract.approval_policy;

        if self.auto_approvable(call, contract) {
            let decision = ApprovalDecision::Approved {
                auto: true,
                actor: None,
            };
            info!(call_id = %call.call_id, tool = %call.tool_id, "call auto-approved");
            self.events.append(
                EventKind::CallApproved,
                Some(call.episode_id),
                serde_json::json!({
                    "call_id": call.call_id,
                    "tool_id": call.tool_id,
                    "auto": true,
                }),
            );
            self.journal_request(call, policy);
            self.journal_decision(call.call_id, "approved", None, Some("auto"));
            return decision;
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            pending.insert(
                call.call_id,
                PendingEntry {
                    request: PendingApproval {
                        call: call.clone(),
                        policy,
                        justification: justification.to_owned(),
                        requested_at: Utc::now(),
                        timeout,
                    },
                    sender: tx,
                },
            );
        }

        info!(
            call_id = %call.call_id,
            tool = %call.tool_id,
            source = %call.source,
            "approval requested"
        );
        self.events.append(
            EventKind::CallApprovalRequested,
            Some(call.episode_id),
            serde_json::json!({
                "call_id": call.call_id,
                "tool_id": call.tool_id,
                "source": call.source,
                "justification": justification,
                "timeout_ms": self.config.timeout_ms,
            }),
        );
        self.journal_request(call, policy);

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            res = &mut rx => match res {
                Ok(decision) => decision,
                // Sender dropped without a decision: the request was
                // cancelled out from under the waiter.
                Err(_) => ApprovalDecision::Denied {
                    reason: "cancelled".to_owned(),
                    actor: None,
                },
            },
            () = &mut sleep => {
                match self.resolve(call.call_id, timeout_decision(), Some("timeout")) {
                    Ok(decision) => decision,
                    // Lost the race: a real decision landed as the clock
                    // expired. Honor it.
                    Err(ApprovalError::NotFound(_)) => rx.await.unwrap_or(
                        ApprovalDecision::Denied {
                            reason: "cancelled".to_owned(),
                            actor: None,
                        },
                    ),
                }
            }
        }
    }

    /// Operator approval.
    pub fn approve(&self, call_id: Uuid, actor: &str) -> Result<(), ApprovalError> {
        self.resolve(
            call_id,
            ApprovalDecision::Approved {
                auto: false,
                actor: Some(actor.to_owned()),
            },
            None,
        )
        .map(|_| ())
    }

    /// Operator denial.
    pub fn deny(&self, call_id: Uuid, actor: &str, reason: &str) -> Result<(), ApprovalError> {
        self.resolve(
            call_id,
            ApprovalDecision::Denied {
                reason: reason.to_owned(),
                actor: Some(actor.to_owned()),
            },
            None,
        )
        .map(|_| ())
    }

    /// Withdraw a pending request (e.g. episode cancelled).
    pub fn cancel(&self, call_id: Uuid) -> Result<(), ApprovalError> {
        self.resolve(
            call_id,
            ApprovalDecision::Denied {
                reason: "cancelled".to_owned(),
                actor: None,
            },
            None,
        )
        .map(|_| ())
    }

    /// Snapshot of pending requests, oldest first.
    pub fn list(&self) -> Vec<PendingApproval> {
        let pending = self.lock_pending();
        let mut requests: Vec<PendingApproval> =
            pending.values().map(|e| e.request.clone()).collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Number of requests awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Whether any pending request has outlived its timeout.
    ///
    /// The invariant checker treats an overdue pending request as a
    /// violation: the waiter should have auto-denied it already.
    pub fn has_overdue(&self, now: DateTime<Utc>) -> bool {
        self.lock_pending()
            .values()
            .any(|e| e.request.is_overdue(now))
    }

    /// Auto-deny requests that outlived their timeout and lost their waiter.
    ///
    /// Returns the number of requests swept.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = {
            let pending = self.lock_pending();
            pending
                .iter()
                .filter(|(_, e)| e.request.is_overdue(now))
                .map(|(id, _)| *id)
                .collect()
        };

        let count = expired.len();
        for call_id in expired {
            if let Err(e) = self.resolve(call_id, timeout_decision(), Some("sweep")) {
                warn!(call_id = %call_id, error = %e, "expired approval vanished mid-sweep");
            }
        }
        count
    }

    /// Default timeout for new requests.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Whether `request` would resolve without a human. The pipeline uses
    /// this to decide if the episode enters `awaiting_approval` at all.
    pub fn would_auto_approve(&self, call: &ToolCall, contract: &ToolContract) -> bool {
        self.auto_approvable(call, contract)
    }

    fn auto_approvable(&self, call: &ToolCall, contract: &ToolContract) -> bool {
        match contract.approval_policy {
            ApprovalPolicy::None => true,
            ApprovalPolicy::AutoIfReadOnly => {
                contract.read_only && self.config.auto_approve_read_only
            }
            ApprovalPolicy::SourceTrusted => self
                .config
                .auto_approve_sources
                .iter()
                .any(|s| *s == call.source.to_string()),
            ApprovalPolicy::Always => false,
        }
    }

    /// Remove a pending entry, emit its terminal event, journal the
    /// decision, and wake the waiter. The single place decisions happen.
    fn resolve(
        &self,
        call_id: Uuid,
        decision: ApprovalDecision,
        via: Option<&str>,
    ) -> Result<ApprovalDecision, ApprovalError> {
        let entry = {
            let mut pending = self.lock_pending();
            pending
                .remove(&call_id)
                .ok_or(ApprovalError::NotFound(call_id))?
        };

        let episode_id = entry.request.call.episode_id;
        match &decision {
            ApprovalDecision::Approved { actor, .. } => {
                info!(call_id = %call_id, actor = ?actor, "approval granted");
                self.events.append(
                    EventKind::CallApproved,
                    Some(episode_id),
                    serde_json::json!({
                        "call_id": call_id,
                        "tool_id": entry.request.call.tool_id,
                        "auto": false,
                        "actor": actor,
                    }),
                );
                self.journal_decision(call_id, "approved", actor.as_deref(), via);
            }
            ApprovalDecision::Denied { reason, actor } => {
                info!(call_id = %call_id, %reason, actor = ?actor, "approval denied");
                self.events.append(
                    EventKind::CallDenied,
                    Some(episode_id),
                    serde_json::json!({
                        "call_id": call_id,
                        "tool_id": entry.request.call.tool_id,
                        "reason": reason,
                        "actor": actor,
                    }),
                );
                self.journal_decision(call_id, "denied", actor.as_deref(), Some(reason));
            }
        }

        // Waiter may be gone (episode cancelled); that is fine.
        let _send = entry.sender.send(decision.clone());
        Ok(decision)
    }

    fn journal_request(&self, call: &ToolCall, policy: ApprovalPolicy) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.insert_approval_request(call, policy) {
                warn!(call_id = %call.call_id, error = %e, "failed to journal approval request");
            }
        }
    }

    fn journal_decision(
        &self,
        call_id: Uuid,
        decision: &str,
        actor: Option<&str>,
        reason: Option<&str>,
    ) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_approval_decision(call_id, decision, actor, reason) {
                warn!(call_id = %call_id, error = %e, "failed to journal approval decision");
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingEntry>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn timeout_decision() -> ApprovalDecision {
    ApprovalDecision::Denied {
        reason: "timeout".to_owned(),
        actor: None,
    }
}
