//! Execution pipeline — drives one plan step through the full gauntlet.
//!
//! Order per step: schema-validate input, resolve approval, invoke the tool
//! against its deadline, schema-validate output, run post-conditions, run
//! invariants, commit the result to memory. Any failure becomes a terminal
//! step outcome: the registered compensation runs (or `NoCompensation`
//! surfaces for a non-read-only tool), `call.failed` is emitted, and the
//! episode machine lands in `failed`. Failures never kill the kernel.
//!
//! While safe mode is active every non-read-only call is refused with
//! `SafeModeActive` before approval is even requested.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::approval::{ApprovalDecision, ApprovalGate};
use crate::kernel::compensation::CompensationRegistry;
use crate::kernel::event_store::EventStore;
use crate::kernel::fsm::EpisodeStateMachine;
use crate::kernel::invariants::{Checkpoint, InvariantChecker};
use crate::kernel::memory::MemoryGate;
use crate::kernel::postcond::PostConditionVerifier;
use crate::kernel::registry::ToolRegistry;
use crate::kernel::safe_mode::SafeModeController;
use crate::kernel::schema::{SchemaValidator, ValidationError};
use crate::types::{
    CallSource, EpisodeState, EventKind, MemoryCandidate, MemoryState, PlanStep, Provenance,
    RollbackPolicy, ToolCall, ToolCallResult, ToolContract,
};

/// Memory kind under which tool results are committed.
const TOOL_RESULT_KIND: &str = "tool_result";

/// Terminal step failures. All are recovered locally; none kill the kernel.
#[derive(Debug, Error)]
pub enum StepError {
    /// Safe mode refused a non-read-only call.
    #[error("safe mode active")]
    SafeModeActive,
    /// Input or output violated the contract.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The approval gate returned a denial.
    #[error("approval denied: {0}")]
    ApprovalDenied(String),
    /// The tool outlived its deadline.
    #[error("tool timeout after {0}ms")]
    ToolTimeout(u64),
    /// The tool ran and failed.
    #[error("tool error: {0}")]
    Tool(String),
    /// A post-condition check failed.
    #[error("post-condition '{check}' failed: {reason}")]
    PostConditionFailed { check: String, reason: String },
    /// An invariant was violated at a checkpoint.
    #[error("invariant '{invariant}' violated: {detail}")]
    InvariantViolated { invariant: String, detail: String },
    /// The episode's cancellation token fired mid-step.
    #[error("episode cancelled")]
    Cancelled,
}

/// What happened to one step.
#[derive(Debug)]
pub struct StepOutcome {
    pub call: ToolCall,
    pub result: Option<ToolCallResult>,
    pub error: Option<StepError>,
    /// A compensation ran for this step.
    pub compensated: bool,
}

impl StepOutcome {
    /// True when the step committed cleanly.
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives plan steps through validation, approval, execution, verification,
/// and commit.
pub struct ExecutionPipeline {
    registry: Arc<ToolRegistry>,
    validator: Arc<SchemaValidator>,
    approvals: Arc<ApprovalGate>,
    verifier: Arc<PostConditionVerifier>,
    invariants: Arc<InvariantChecker>,
    memory: Arc<MemoryGate>,
    compensations: Arc<CompensationRegistry>,
    safe_mode: Arc<SafeModeController>,
    events: Arc<EventStore>,
    default_timeout_ms: u64,
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("default_timeout_ms", &self.default_timeout_ms)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)] // assembly happens once, in the kernel builder
impl ExecutionPipeline {
    /// Wire the pipeline to the components it drives.
    pub fn new(
        registry: Arc<ToolRegistry>,
        validator: Arc<SchemaValidator>,
        approvals: Arc<ApprovalGate>,
        verifier: Arc<PostConditionVerifier>,
        invariants: Arc<InvariantChecker>,
        memory: Arc<MemoryGate>,
        compensations: Arc<CompensationRegistry>,
        safe_mode: Arc<SafeModeController>,
        events: Arc<EventStore>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            validator,
            approvals,
            verifier,
            invariants,
            memory,
            compensations,
            safe_mode,
            events,
            default_timeout_ms,
        }
    }

    /// Execute one plan step for the episode `fsm` belongs to.
    ///
    /// Expects the machine in `planning`. On success the machine is left in
    /// `committing`; the orchestrator decides whether the episode is done or
    /// loops back to `planning` for the next step. On failure the machine is
    /// left in `failed` (or `safe_mode`).
    pub async fn execute_step(
        &self,
        fsm: &EpisodeStateMachine,
        step: &PlanStep,
        source: &CallSource,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let episode_id = fsm.episode_id();
        let call = ToolCall {
            call_id: Uuid::new_v4(),
            tool_id: step.tool_id.clone(),
            input: step.input.clone(),
            source: source.clone(),
            episode_id,
            step_index: step.step_index,
            created_at: Utc::now(),
        };

        self.events.append(
            EventKind::CallRequested,
            Some(episode_id),
            serde_json::json!({
                "call_id": call.call_id,
                "tool_id": call.tool_id,
                "step_index": call.step_index,
                "source": call.source,
            }),
        );

        // Resolve the contract before anything else; an unknown tool is a
        // validation failure.
        let Some(registered) = self.registry.get(&call.tool_id) else {
            let error = ValidationError::UnknownTool(call.tool_id.clone());
            self.emit_validated(&call, "input", Some(&error.to_string()));
            return self.fail_before_execution(fsm, call, error.into()).await;
        };
        let contract = registered.contract.clone();
        let handler = registered.handler.clone();

        // Safe mode: only read-only contracts may proceed.
        if self.safe_mode.is_active() && !contract.read_only {
            warn!(call_id = %call.call_id, tool = %call.tool_id, "rejected by safe mode");
            return self
                .fail_before_execution(fsm, call, StepError::SafeModeActive)
                .await;
        }

        if cancel.is_cancelled() {
            return self
                .fail_before_execution(fsm, call, StepError::Cancelled)
                .await;
        }

        // 1. Input schema.
        if let Err(error) = self.validator.validate_input(&call) {
            self.emit_validated(&call, "input", Some(&error.to_string()));
            return self.fail_before_execution(fsm, call, error.into()).await;
        }
        self.emit_validated(&call, "input", None);

        // 2. Approval.
        let auto = self.approvals.would_auto_approve(&call, &contract);
        if !auto {
            if let Err(e) = fsm.transition(EpisodeState::AwaitingApproval) {
                warn!(error = %e, "episode not in planning at approval");
            }
        }
        let decision = self
            .approvals
            .request(&call, &contract, &step.justification)
            .await;
        if let ApprovalDecision::Denied { reason, .. } = decision {
            let error = StepError::ApprovalDenied(reason);
            return self
                .fail_step(fsm, call, None, &contract, step.rollback_policy, error)
                .await;
        }

        // 3. Execute against the deadline.
        if let Err(e) = fsm.transition(EpisodeState::Executing) {
            warn!(error = %e, "episode could not enter executing");
        }
        self.events.append(
            EventKind::CallStarted,
            Some(episode_id),
            serde_json::json!({"call_id": call.call_id, "tool_id": call.tool_id}),
        );

        let timeout_ms = if contract.timeout_ms > 0 {
            contract.timeout_ms
        } else {
            self.default_timeout_ms
        };
        let started_at = Utc::now();
        let invocation = handler.invoke(&call);

        let outcome = tokio::select! {
            res = invocation => Some(res),
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
            () = cancel.cancelled() => {
                let result = failed_result(&call, started_at, "cancelled");
                return self
                    .fail_step(fsm, call, Some(result), &contract, step.rollback_policy, StepError::Cancelled)
                    .await;
            }
        };

        let output = match outcome {
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                let reason = e.to_string();
                let result = failed_result(&call, started_at, &reason);
                return self
                    .fail_step(
                        fsm,
                        call,
                        Some(result),
                        &contract,
                        step.rollback_policy,
                        StepError::Tool(reason),
                    )
                    .await;
            }
            None => {
                let result = failed_result(&call, started_at, "tool_timeout");
                return self
                    .fail_step(
                        fsm,
                        call,
                        Some(result),
                        &contract,
                        step.rollback_policy,
                        StepError::ToolTimeout(timeout_ms),
                    )
                    .await;
            }
        };

        let mut result = ToolCallResult {
            call_id: call.call_id,
            ok: true,
            output: Some(output.clone()),
            error: None,
            started_at,
            finished_at: Utc::now(),
            compensated: false,
        };
        self.events.append(
            EventKind::CallSucceeded,
            Some(episode_id),
            serde_json::json!({
                "call_id": call.call_id,
                "tool_id": call.tool_id,
                "output": output,
            }),
        );
        if let Err(e) = fsm.transition(EpisodeState::Verifying) {
            warn!(error = %e, "episode could not enter verifying");
        }

        // 4. Output schema.
        if let Err(error) = self.validator.validate_output(&call.tool_id, &output) {
            self.emit_validated(&call, "output", Some(&error.to_string()));
            return self
                .fail_step(fsm, call, Some(result), &contract, step.rollback_policy, error.into())
                .await;
        }

        // 5. Post-conditions.
        let verdict = self
            .verifier
            .verify(&contract.post_conditions, &call, &result)
            .await;
        if !verdict.ok {
            let check = verdict.failed_check.unwrap_or_else(|| "unknown".to_owned());
            let reason = verdict.reason.unwrap_or_else(|| "check failed".to_owned());
            self.events.append(
                EventKind::PostcondFailed,
                Some(episode_id),
                serde_json::json!({
                    "call_id": call.call_id,
                    "check_id": check,
                    "reason": reason,
                }),
            );
            return self
                .fail_step(
                    fsm,
                    call,
                    Some(result),
                    &contract,
                    step.rollback_policy,
                    StepError::PostConditionFailed { check, reason },
                )
                .await;
        }

        // 6. Invariants gate the transition into committing.
        let violations = self.invariants.check(Checkpoint::BeforeCommit, Some(fsm));
        if let Some(violation) = violations.first() {
            return self.trip_safe_mode(fsm, call, result, violation.clone());
        }

        // 7. Commit the result to memory.
        if let Err(e) = fsm.transition(EpisodeState::Committing) {
            warn!(error = %e, "episode could not enter committing");
        }
        let admit = self.memory.admit(tool_result_candidate(&call, &output));
        let written = match admit.state {
            MemoryState::Committed | MemoryState::Quarantined => admit.id,
            // A duplicate tool result means this knowledge is already in
            // memory; the write is a no-op, not a failure.
            MemoryState::Rejected | MemoryState::Draft => None,
        };

        // Re-check while still in committing: a violation here means the
        // write itself broke an invariant. Back the entry out to quarantine
        // and fail with compensation.
        let violations = self.invariants.check(Checkpoint::BeforeCommit, Some(fsm));
        if let Some(violation) = violations.first() {
            if let Some(id) = written {
                if let Err(e) = self.memory.quarantine(id) {
                    warn!(id = %id, error = %e, "failed to quarantine backed-out entry");
                }
            }
            return self
                .fail_step(
                    fsm,
                    call,
                    Some(result),
                    &contract,
                    step.rollback_policy,
                    StepError::InvariantViolated {
                        invariant: violation.invariant_id.clone(),
                        detail: violation.detail.clone(),
                    },
                )
                .await;
        }

        info!(call_id = %call.call_id, tool = %call.tool_id, "step committed");
        result.finished_at = Utc::now();
        StepOutcome {
            call,
            result: Some(result),
            error: None,
            compensated: false,
        }
    }

    /// Fail a step that never reached `executing`: no side effects exist, so
    /// no compensation runs. Emits `call.failed` and lands in `failed`.
    async fn fail_before_execution(
        &self,
        fsm: &EpisodeStateMachine,
        call: ToolCall,
        error: StepError,
    ) -> StepOutcome {
        self.emit_call_failed(&call, &error.to_string());
        if let Err(e) = fsm.transition(EpisodeState::Failed) {
            warn!(error = %e, "episode could not enter failed");
        }
        StepOutcome {
            call,
            result: None,
            error: Some(error),
            compensated: false,
        }
    }

    /// Shared failure path once a call existed: run the compensation (or
    /// surface `NoCompensation`), emit `call.failed` last, land in `failed`.
    async fn fail_step(
        &self,
        fsm: &EpisodeStateMachine,
        call: ToolCall,
        result: Option<ToolCallResult>,
        contract: &ToolContract,
        rollback: RollbackPolicy,
        error: StepError,
    ) -> StepOutcome {
        let state = fsm.state();
        if matches!(
            state,
            EpisodeState::Executing | EpisodeState::Verifying | EpisodeState::Committing
        ) {
            if let Err(e) = fsm.transition(EpisodeState::Compensating) {
                warn!(error = %e, "episode could not enter compensating");
            }
        }

        let mut compensated = false;
        let mut result = result.unwrap_or_else(|| failed_result(&call, call.created_at, "never ran"));
        if !contract.read_only && rollback == RollbackPolicy::Attempt {
            match &contract.compensation_id {
                Some(compensation_id) => {
                    let outcome = self
                        .compensations
                        .run(compensation_id, &call, &result)
                        .await;
                    compensated = true;
                    result.compensated = true;
                    if !outcome.ok {
                        warn!(
                            call_id = %call.call_id,
                            compensation = %compensation_id,
                            error = ?outcome.error,
                            "compensation itself failed"
                        );
                    }
                }
                None => {
                    // A failing non-read-only tool without an inverse is its
                    // own post-condition failure.
                    self.events.append(
                        EventKind::PostcondFailed,
                        Some(call.episode_id),
                        serde_json::json!({
                            "call_id": call.call_id,
                            "check_id": "NoCompensation",
                            "reason": format!(
                                "no compensation registered for non-read-only tool '{}'",
                                call.tool_id
                            ),
                        }),
                    );
                }
            }
        }

        self.emit_call_failed(&call, &error.to_string());

        // Post-compensation invariants. The episode is already failing, so a
        // violation here only escalates to safe mode.
        if compensated {
            let violations = self.invariants.check(Checkpoint::AfterCompensation, Some(fsm));
            if let Some(violation) = violations.first() {
                self.safe_mode.enter(&format!(
                    "invariant {} violated after compensation: {}",
                    violation.invariant_id, violation.detail
                ));
            }
        }

        let state = fsm.state();
        if state == EpisodeState::Compensating
            || state == EpisodeState::Planning
            || state == EpisodeState::AwaitingApproval
        {
            if let Err(e) = fsm.transition(EpisodeState::Failed) {
                warn!(error = %e, "episode could not enter failed");
            }
        }

        StepOutcome {
            call,
            result: Some(result),
            error: Some(error),
            compensated,
        }
    }

    /// An invariant violation downgrades the episode and trips safe mode.
    fn trip_safe_mode(
        &self,
        fsm: &EpisodeStateMachine,
        call: ToolCall,
        result: ToolCallResult,
        violation: crate::kernel::invariants::InvariantViolation,
    ) -> StepOutcome {
        self.safe_mode.enter(&format!(
            "invariant {} violated: {}",
            violation.invariant_id, violation.detail
        ));
        if let Err(e) = fsm.transition(EpisodeState::SafeMode) {
            warn!(error = %e, "episode could not enter safe_mode");
        }
        let _entry_check = self.invariants.check(Checkpoint::SafeModeEntry, Some(fsm));
        StepOutcome {
            call,
            result: Some(result),
            error: Some(StepError::InvariantViolated {
                invariant: violation.invariant_id,
                detail: violation.detail,
            }),
            compensated: false,
        }
    }

    fn emit_validated(&self, call: &ToolCall, phase: &str, error: Option<&str>) {
        self.events.append(
            EventKind::CallValidated,
            Some(call.episode_id),
            serde_json::json!({
                "call_id": call.call_id,
                "phase": phase,
                "ok": error.is_none(),
                "error": error,
            }),
        );
    }

    fn emit_call_failed(&self, call: &ToolCall, reason: &str) {
        self.events.append(
            EventKind::CallFailed,
            Some(call.episode_id),
            serde_json::json!({
                "call_id": call.call_id,
                "tool_id": call.tool_id,
                "reason": reason,
            }),
        );
    }
}

fn failed_result(call: &ToolCall, started_at: chrono::DateTime<Utc>, reason: &str) -> ToolCallResult {
    ToolCallResult {
        call_id: call.call_id,
        ok: false,
        output: None,
        error: Some(reason.to_owned()),
        started_at,
        finished_at: Utc::now(),
        compensated: false,
    }
}

/// Wrap a successful tool output as a memory candidate.
fn tool_result_candidate(call: &ToolCall, output: &serde_json::Value) -> MemoryCandidate {
    MemoryCandidate {
        kind: TOOL_RESULT_KIND.to_owned(),
        content: serde_json::json!({
            "tool_id": call.tool_id,
            "call_id": call.call_id,
            "output": output,
        })
        .to_string(),
        embedding: None,
        source: call.source.to_string(),
        provenance: Provenance::KnownPlugin,
        corroboration: 1,
        observed_at: Utc::now(),
    }
}
