//! Role orchestrator — the per-episode control loop.
//!
//! Five roles cooperate per episode: the planner supplies steps (a submitted
//! plan, or an in-process [`Planner`]), the executor drives the pipeline for
//! each step, the verifier's aggregate verdict is polled off the step
//! outcome, the memory writer finalizes inside the pipeline's commit phase,
//! and the auditor inspects drift and invariants between steps. When the
//! auditor fires, the orchestrator trips safe mode and refuses further
//! non-read-only steps until operator reset.
//!
//! The roles never hold references to each other; they communicate through
//! the event store and the shared episode state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::drift::DriftMonitor;
use crate::kernel::event_store::EventStore;
use crate::kernel::fsm::EpisodeStateMachine;
use crate::kernel::invariants::{Checkpoint, InvariantChecker};
use crate::kernel::pipeline::{ExecutionPipeline, StepOutcome};
use crate::kernel::safe_mode::SafeModeController;
use crate::types::{CallSource, EpisodeState, EventKind, PlanStep};

/// An in-process plan producer.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Next plan to run, or `None` when the producer is drained.
    async fn next_plan(&self) -> Option<Vec<PlanStep>>;
}

/// Final shape of one episode.
#[derive(Debug)]
pub struct EpisodeOutcome {
    pub episode_id: Uuid,
    pub state: EpisodeState,
    pub steps: Vec<StepOutcome>,
}

impl EpisodeOutcome {
    /// True when the episode reached `done`.
    pub fn ok(&self) -> bool {
        self.state == EpisodeState::Done
    }
}

/// Composes the roles into a control loop.
pub struct RoleOrchestrator {
    pipeline: Arc<ExecutionPipeline>,
    drift: Arc<DriftMonitor>,
    invariants: Arc<InvariantChecker>,
    safe_mode: Arc<SafeModeController>,
    events: Arc<EventStore>,
    /// Caps concurrent episodes at `workflow.max_concurrent`.
    capacity: Arc<Semaphore>,
    /// Cancellation tokens for in-flight episodes.
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl std::fmt::Debug for RoleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.active.lock().map(|a| a.len()).unwrap_or(0);
        f.debug_struct("RoleOrchestrator")
            .field("active_episodes", &active)
            .finish()
    }
}

impl RoleOrchestrator {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        pipeline: Arc<ExecutionPipeline>,
        drift: Arc<DriftMonitor>,
        invariants: Arc<InvariantChecker>,
        safe_mode: Arc<SafeModeController>,
        events: Arc<EventStore>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            pipeline,
            drift,
            invariants,
            safe_mode,
            events,
            capacity: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Run one submitted plan as an episode, waiting for capacity first.
    ///
    /// The caller supplies the episode ID so `submit_plan` can return it
    /// before capacity frees up.
    pub async fn run_episode(
        &self,
        episode_id: Uuid,
        steps: Vec<PlanStep>,
        source: CallSource,
    ) -> EpisodeOutcome {
        // Serialize against the concurrency cap before emitting anything, so
        // episodes never interleave in the log beyond the cap.
        let _permit = self
            .capacity
            .clone()
            .acquire_owned()
            .await
            .expect("capacity semaphore is never closed");

        let cancel = CancellationToken::new();
        {
            let mut active = self.lock_active();
            active.insert(episode_id, cancel.clone());
        }

        let outcome = self.drive(episode_id, steps, source, cancel).await;

        let mut active = self.lock_active();
        active.remove(&episode_id);
        outcome
    }

    /// Drain an in-process planner, one episode per emitted plan.
    pub async fn run_from_planner(
        &self,
        planner: &dyn Planner,
        source: CallSource,
    ) -> Vec<EpisodeOutcome> {
        let mut outcomes = Vec::new();
        while let Some(steps) = planner.next_plan().await {
            outcomes.push(
                self.run_episode(Uuid::new_v4(), steps, source.clone())
                    .await,
            );
        }
        outcomes
    }

    /// Cancel an in-flight episode. Compensation runs if the episode has
    /// reached `executing` or later.
    pub fn cancel_episode(&self, episode_id: Uuid) -> bool {
        let active = self.lock_active();
        match active.get(&episode_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of episodes currently holding capacity.
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    async fn drive(
        &self,
        episode_id: Uuid,
        steps: Vec<PlanStep>,
        source: CallSource,
        cancel: CancellationToken,
    ) -> EpisodeOutcome {
        let fsm = EpisodeStateMachine::new(episode_id, self.events.clone());

        info!(episode_id = %episode_id, steps = steps.len(), "plan accepted");
        self.events.append(
            EventKind::PlanEmitted,
            Some(episode_id),
            serde_json::json!({
                "episode_id": episode_id,
                "source": source,
                "step_count": steps.len(),
                "tools": steps.iter().map(|s| s.tool_id.clone()).collect::<Vec<_>>(),
            }),
        );

        if let Err(e) = fsm.transition(EpisodeState::Planning) {
            warn!(error = %e, "episode could not start planning");
        }

        let total = steps.len();
        let mut outcomes: Vec<StepOutcome> = Vec::with_capacity(total);

        for (index, step) in steps.into_iter().enumerate() {
            let outcome = self
                .pipeline
                .execute_step(&fsm, &step, &source, &cancel)
                .await;

            // Verifier role: the aggregate verdict is the step outcome.
            let step_ok = outcome.ok();
            let output_text = outcome
                .result
                .as_ref()
                .and_then(|r| r.output.as_ref())
                .map(ToString::to_string);
            outcomes.push(outcome);

            if !step_ok {
                return EpisodeOutcome {
                    episode_id,
                    state: fsm.state(),
                    steps: outcomes,
                };
            }

            // Auditor role: scan the step's output against hard constraints
            // and poll the invariant checker between steps.
            if let Some(text) = output_text {
                let violations = self.drift.scan_constraints(&text, Some(episode_id));
                if !violations.is_empty() {
                    self.enter_safe_mode(
                        &fsm,
                        &format!("hard constraint violated: {}", violations.join(", ")),
                    );
                    return EpisodeOutcome {
                        episode_id,
                        state: fsm.state(),
                        steps: outcomes,
                    };
                }
            }
            if self.drift.window_average() >= self.drift.hard_threshold() {
                self.enter_safe_mode(&fsm, "drift window average past hard threshold");
                return EpisodeOutcome {
                    episode_id,
                    state: fsm.state(),
                    steps: outcomes,
                };
            }

            let is_last = index.saturating_add(1) == total;
            if is_last {
                if let Err(e) = fsm.transition(EpisodeState::Done) {
                    warn!(error = %e, "episode could not close");
                }
            } else {
                // Loop back for the next step.
                if let Err(e) = fsm.transition(EpisodeState::Planning) {
                    warn!(error = %e, "episode could not resume planning");
                }
                let violations = self.invariants.check(Checkpoint::OnDemand, Some(&fsm));
                if let Some(violation) = violations.first() {
                    self.enter_safe_mode(
                        &fsm,
                        &format!(
                            "invariant {} violated between steps: {}",
                            violation.invariant_id, violation.detail
                        ),
                    );
                    return EpisodeOutcome {
                        episode_id,
                        state: fsm.state(),
                        steps: outcomes,
                    };
                }
            }
        }

        // An empty plan completes immediately, walking the shortest legal
        // path to done.
        if total == 0 {
            for to in [
                EpisodeState::Executing,
                EpisodeState::Verifying,
                EpisodeState::Committing,
                EpisodeState::Done,
            ] {
                if fsm.transition(to).is_err() {
                    break;
                }
            }
        }

        EpisodeOutcome {
            episode_id,
            state: fsm.state(),
            steps: outcomes,
        }
    }

    fn enter_safe_mode(&self, fsm: &EpisodeStateMachine, reason: &str) {
        self.safe_mode.enter(reason);
        if let Err(e) = fsm.transition(EpisodeState::SafeMode) {
            warn!(error = %e, "episode could not enter safe_mode");
        }
        let _entry_check = self.invariants.check(Checkpoint::SafeModeEntry, Some(fsm));
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
