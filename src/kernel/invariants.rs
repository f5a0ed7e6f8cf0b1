//! Invariant checker — whole-kernel safety conditions.
//!
//! Evaluated at checkpoints (before committing, after compensation, on
//! safe-mode entry/exit) and on demand from the control surface. A violation
//! emits `invariant.violated`; the pipeline reacts by failing the episode
//! and tripping safe mode.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::kernel::approval::ApprovalGate;
use crate::kernel::drift::DriftMonitor;
use crate::kernel::event_store::EventStore;
use crate::kernel::fsm::{reachable_terminal, EpisodeStateMachine};
use crate::kernel::memory::MemoryGate;
use crate::types::{EventKind, MemoryState, TrustTier};

/// Where in the lifecycle a check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    BeforeCommit,
    AfterCompensation,
    SafeModeEntry,
    SafeModeExit,
    OnDemand,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BeforeCommit => "before_commit",
            Self::AfterCompensation => "after_compensation",
            Self::SafeModeEntry => "safe_mode_entry",
            Self::SafeModeExit => "safe_mode_exit",
            Self::OnDemand => "on_demand",
        };
        f.write_str(s)
    }
}

/// One violated invariant.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    pub invariant_id: String,
    pub detail: String,
}

/// Runs the built-in invariants over the live kernel components.
pub struct InvariantChecker {
    memory: Arc<MemoryGate>,
    drift: Arc<DriftMonitor>,
    approvals: Arc<ApprovalGate>,
    events: Arc<EventStore>,
    /// No committed entry may score below this (the configured quarantine
    /// threshold).
    quarantine_floor: f64,
    enabled: bool,
}

impl std::fmt::Debug for InvariantChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantChecker")
            .field("enabled", &self.enabled)
            .field("quarantine_floor", &self.quarantine_floor)
            .finish()
    }
}

impl InvariantChecker {
    /// Wire the checker to the components it inspects.
    pub fn new(
        memory: Arc<MemoryGate>,
        drift: Arc<DriftMonitor>,
        approvals: Arc<ApprovalGate>,
        events: Arc<EventStore>,
        quarantine_floor: f64,
        enabled: bool,
    ) -> Self {
        Self {
            memory,
            drift,
            approvals,
            events,
            quarantine_floor,
            enabled,
        }
    }

    /// Run every invariant at the given checkpoint.
    ///
    /// Returns the violations (empty when disabled) and emits one
    /// `invariant.violated` event per violation.
    pub fn check(
        &self,
        checkpoint: Checkpoint,
        episode: Option<&EpisodeStateMachine>,
    ) -> Vec<InvariantViolation> {
        if !self.enabled {
            return Vec::new();
        }

        let mut violations = Vec::new();

        // No quarantined or sub-floor entry in the committed set.
        for entry in self.memory.committed_entries() {
            if entry.state != MemoryState::Committed {
                continue;
            }
            if entry.trust.tier == TrustTier::Quarantine {
                violations.push(InvariantViolation {
                    invariant_id: "memory.commit_gate".to_owned(),
                    detail: format!("committed entry {} has quarantine tier", entry.id),
                });
            } else if entry.trust.value < self.quarantine_floor {
                violations.push(InvariantViolation {
                    invariant_id: "memory.commit_gate".to_owned(),
                    detail: format!(
                        "committed entry {} scores {} below quarantine floor {}",
                        entry.id, entry.trust.value, self.quarantine_floor
                    ),
                });
            }
        }

        // Drift stays under the hard bound.
        let average = self.drift.window_average();
        if average >= self.drift.hard_threshold() {
            violations.push(InvariantViolation {
                invariant_id: "drift.bounds".to_owned(),
                detail: format!(
                    "drift window average {} at or above hard threshold {}",
                    average,
                    self.drift.hard_threshold()
                ),
            });
        }

        // No pending approval older than its timeout.
        if self.approvals.has_overdue(Utc::now()) {
            violations.push(InvariantViolation {
                invariant_id: "approval.no_overdue".to_owned(),
                detail: "pending approval request outlived its timeout".to_owned(),
            });
        }

        // The episode machine can still reach a terminal state.
        if let Some(fsm) = episode {
            let state = fsm.state();
            if !state.is_terminal() && !reachable_terminal(state) {
                violations.push(InvariantViolation {
                    invariant_id: "fsm.reachable".to_owned(),
                    detail: format!("no terminal path from state {state}"),
                });
            }
        }

        for violation in &violations {
            warn!(
                invariant = %violation.invariant_id,
                detail = %violation.detail,
                %checkpoint,
                "invariant violated"
            );
            self.events.append(
                EventKind::InvariantViolated,
                episode.map(EpisodeStateMachine::episode_id),
                serde_json::json!({
                    "invariant_id": violation.invariant_id,
                    "detail": violation.detail,
                    "checkpoint": checkpoint.to_string(),
                }),
            );
        }

        violations
    }

    /// Whether checkpoint evaluation is on.
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApprovalSection, DriftSection, EventStoreSection, TrustSection};
    use crate::kernel::event_store::EventQuery;
    use crate::kernel::trust::TrustScorer;
    use crate::types::{
        HardConstraint, IdentityDescriptor, MemoryCandidate, PersonaProfile, Provenance,
    };

    fn identity() -> IdentityDescriptor {
        IdentityDescriptor {
            version: 0,
            hash: String::new(),
            persona: PersonaProfile {
                summary: "assistant".to_owned(),
                allowed_topics: vec!["calendar email".to_owned()],
            },
            communication_style: "concise calendar and email help".to_owned(),
            soft_preferences: vec![],
            hard_constraints: vec![HardConstraint {
                id: "no-secrets".to_owned(),
                description: "never leak secrets".to_owned(),
                forbidden_terms: vec!["private key".to_owned()],
            }],
        }
    }

    struct Fixture {
        checker: InvariantChecker,
        memory: Arc<MemoryGate>,
        drift: Arc<DriftMonitor>,
        events: Arc<EventStore>,
    }

    fn fixture(enabled: bool, drift_config: DriftSection) -> Fixture {
        let events = Arc::new(EventStore::new(EventStoreSection::default()));
        let memory = Arc::new(MemoryGate::new(
            TrustScorer::new(&TrustSection::default()),
            TrustTier::Medium,
            events.clone(),
        ));
        let drift = Arc::new(DriftMonitor::new(identity(), drift_config, events.clone()));
        let approvals = Arc::new(ApprovalGate::new(ApprovalSection::default(), events.clone()));
        let checker = InvariantChecker::new(
            memory.clone(),
            drift.clone(),
            approvals,
            events.clone(),
            0.1,
            enabled,
        );
        Fixture {
            checker,
            memory,
            drift,
            events,
        }
    }

    #[test]
    fn test_clean_kernel_has_no_violations() {
        let f = fixture(true, DriftSection::default());
        f.memory.admit(MemoryCandidate {
            kind: "fact".to_owned(),
            content: "solid fact".to_owned(),
            embedding: None,
            source: "user".to_owned(),
            provenance: Provenance::UserTyped,
            corroboration: 1,
            observed_at: Utc::now(),
        });

        let violations = f.checker.check(Checkpoint::OnDemand, None);
        assert!(violations.is_empty(), "got {violations:?}");
    }

    #[test]
    fn test_drift_past_hard_threshold_violates() {
        let f = fixture(
            true,
            DriftSection {
                window_size: 2,
                soft_threshold: 0.1,
                hard_threshold: 0.3,
            },
        );
        f.drift.observe("zorp blark quux flimflam vorpal", None);
        f.drift.observe("snicker snack jabberwock", None);

        let violations = f.checker.check(Checkpoint::BeforeCommit, None);
        assert!(violations
            .iter()
            .any(|v| v.invariant_id == "drift.bounds"));

        let emitted = f.events.query(&EventQuery {
            kinds: Some(vec![EventKind::InvariantViolated]),
            ..EventQuery::default()
        });
        assert!(!emitted.is_empty());
        assert_eq!(emitted[0].payload["checkpoint"], "before_commit");
    }

    #[test]
    fn test_disabled_checker_reports_nothing() {
        let f = fixture(
            false,
            DriftSection {
                window_size: 2,
                soft_threshold: 0.1,
                hard_threshold: 0.2,
            },
        );
        f.drift.observe("zorp blark quux", None);
        f.drift.observe("flimflam vorpal", None);

        let violations = f.checker.check(Checkpoint::OnDemand, None);
        assert!(violations.is_empty());
        assert!(f
            .events
            .query(&EventQuery {
                kinds: Some(vec![EventKind::InvariantViolated]),
                ..EventQuery::default()
            })
            .is_empty());
    }

    #[test]
    fn test_episode_reachability_checked() {
        let f = fixture(true, DriftSection::default());
        let fsm = EpisodeStateMachine::new(uuid::Uuid::new_v4(), f.events.clone());
        fsm.transition(crate::types::EpisodeState::Planning)
            .expect("legal");

        let violations = f.checker.check(Checkpoint::OnDemand, Some(&fsm));
        assert!(
            violations.is_empty(),
            "planning reaches terminal states: {violations:?}"
        );
    }
}
