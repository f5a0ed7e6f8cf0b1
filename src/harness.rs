//! Baseline harness — scripted scenarios against a composed kernel.
//!
//! Each scenario assembles a fresh kernel over in-memory stores, drives it
//! through one safety-critical path, and checks the event log and terminal
//! state. Run via the `baseline` launcher subcommand; not in the request
//! path. The scenario library seeds the regression suite.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::KernelConfig;
use crate::kernel::event_store::EventQuery;
use crate::kernel::handle::KernelHandle;
use crate::kernel::memory::RetrieveOptions;
use crate::kernel::postcond::CheckOutcome;
use crate::kernel::registry::{ToolError, ToolHandler};
use crate::types::{
    ApprovalPolicy, CallSource, EpisodeState, EventKind, HardConstraint, IdentityDescriptor,
    MemoryCandidate, MemoryState, PersonaProfile, PlanStep, Provenance, RollbackPolicy, ToolCall,
    ToolContract,
};

/// Result of one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Aggregate harness result.
#[derive(Debug, Clone)]
pub struct HarnessReport {
    pub passed: usize,
    pub failed: usize,
    pub details: Vec<ScenarioReport>,
}

impl HarnessReport {
    /// True when every scenario passed.
    pub fn ok(&self) -> bool {
        self.failed == 0
    }
}

/// Run the full scenario library.
pub async fn run_all() -> HarnessReport {
    let scenarios: Vec<(&str, ScenarioResult)> = vec![
        ("read_only_auto_approve", read_only_auto_approve().await),
        ("approval_timeout", approval_timeout().await),
        ("quarantine_roundtrip", quarantine_roundtrip().await),
        ("drift_hard_violation", drift_hard_violation().await),
        ("compensation_on_postcond_fail", compensation_on_postcond_fail().await),
        ("concurrent_plans_serialize", concurrent_plans_serialize().await),
    ];

    let mut report = HarnessReport {
        passed: 0,
        failed: 0,
        details: Vec::new(),
    };
    for (name, result) in scenarios {
        let (passed, detail) = match result {
            Ok(()) => (true, "ok".to_owned()),
            Err(detail) => (false, detail),
        };
        if passed {
            report.passed = report.passed.saturating_add(1);
        } else {
            report.failed = report.failed.saturating_add(1);
        }
        info!(scenario = name, passed, "baseline scenario finished");
        report.details.push(ScenarioReport {
            name: name.to_owned(),
            passed,
            detail,
        });
    }
    report
}

type ScenarioResult = Result<(), String>;

/// Closure-backed tool for scenario fixtures.
struct FnTool<F>(F);

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(&ToolCall) -> Result<serde_json::Value, ToolError> + Send + Sync,
{
    async fn invoke(&self, call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        (self.0)(call)
    }
}

fn ensure(condition: bool, message: &str) -> ScenarioResult {
    if condition {
        Ok(())
    } else {
        Err(message.to_owned())
    }
}

fn step(index: usize, tool_id: &str, input: serde_json::Value) -> PlanStep {
    PlanStep {
        step_index: index,
        tool_id: tool_id.to_owned(),
        input,
        justification: format!("baseline scenario step for {tool_id}"),
        rollback_policy: RollbackPolicy::Attempt,
    }
}

fn open_contract(id: &str, read_only: bool, policy: ApprovalPolicy) -> ToolContract {
    ToolContract {
        id: id.to_owned(),
        version: 1,
        input_schema: serde_json::json!({"type": "object"}),
        output_schema: serde_json::json!({"type": "object"}),
        read_only,
        approval_policy: policy,
        post_conditions: vec![],
        compensation_id: None,
        timeout_ms: 2_000,
    }
}

fn kinds_for(kernel: &KernelHandle, episode_id: uuid::Uuid) -> Vec<EventKind> {
    kernel
        .get_episode(episode_id)
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

/// Register a read-only `echo`, auto-approve it, expect a clean `done` with
/// a synthetic approval and no approval request.
async fn read_only_auto_approve() -> ScenarioResult {
    let kernel = KernelHandle::builder(KernelConfig::default())
        .build()
        .map_err(|e| e.to_string())?;
    kernel.start();

    let outcome = kernel
        .run_plan(
            vec![step(0, "echo", serde_json::json!({"msg": "hi"}))],
            CallSource::Planner,
        )
        .await
        .map_err(|e| e.to_string())?;

    ensure(outcome.state == EpisodeState::Done, "episode should be done")?;
    let kinds = kinds_for(&kernel, outcome.episode_id);
    ensure(
        kinds.contains(&EventKind::CallSucceeded),
        "expected call.succeeded",
    )?;
    ensure(
        !kinds.contains(&EventKind::CallApprovalRequested),
        "auto-approval must not request approval",
    )?;

    let approved = kernel
        .get_episode(outcome.episode_id)
        .into_iter()
        .find(|e| e.kind == EventKind::CallApproved)
        .ok_or("expected synthetic call.approved")?;
    ensure(
        approved.payload["auto"] == serde_json::Value::Bool(true),
        "approval must be synthetic (auto: true)",
    )
}

/// A non-read-only tool with no operator online: the request times out,
/// the call fails, and `NoCompensation` surfaces.
async fn approval_timeout() -> ScenarioResult {
    let mut config = KernelConfig::default();
    config.approval.timeout_ms = 50;
    let kernel = KernelHandle::builder(config)
        .tool(
            open_contract("delete_file", false, ApprovalPolicy::Always),
            Arc::new(FnTool(|_call: &ToolCall| {
                Ok(serde_json::json!({"deleted": true}))
            })),
        )
        .build()
        .map_err(|e| e.to_string())?;
    kernel.start();

    let outcome = kernel
        .run_plan(
            vec![step(0, "delete_file", serde_json::json!({"path": "/tmp/x"}))],
            CallSource::Planner,
        )
        .await
        .map_err(|e| e.to_string())?;

    ensure(
        outcome.state == EpisodeState::Failed,
        "episode should be failed",
    )?;

    let events = kernel.get_episode(outcome.episode_id);
    let denied = events
        .iter()
        .find(|e| e.kind == EventKind::CallDenied)
        .ok_or("expected call.denied")?;
    ensure(
        denied.payload["reason"] == "timeout",
        "denial reason must be timeout",
    )?;
    ensure(
        events.iter().any(|e| e.kind == EventKind::CallFailed),
        "expected call.failed",
    )?;
    let no_comp = events
        .iter()
        .find(|e| e.kind == EventKind::PostcondFailed)
        .ok_or("expected postcond.failed for missing compensation")?;
    ensure(
        no_comp.payload["check_id"] == "NoCompensation",
        "missing compensation must surface as NoCompensation",
    )
}

/// A low-trust candidate lands in quarantine, stays hidden from default
/// retrieval, and rehabilitates back to committed.
async fn quarantine_roundtrip() -> ScenarioResult {
    let kernel = KernelHandle::builder(KernelConfig::default())
        .build()
        .map_err(|e| e.to_string())?;
    kernel.start();

    let outcome = kernel.memory().admit(MemoryCandidate {
        kind: "fact".to_owned(),
        content: "the moon base opens tuesday".to_owned(),
        embedding: None,
        source: "planner".to_owned(),
        provenance: Provenance::ModelInferred,
        corroboration: 0,
        observed_at: chrono::Utc::now(),
    });
    ensure(
        outcome.state == MemoryState::Quarantined,
        "model-inferred candidate should quarantine",
    )?;
    let id = outcome.id.ok_or("quarantined entry should have an id")?;

    ensure(
        kernel.retrieve("", RetrieveOptions::default()).is_empty(),
        "default retrieval must hide quarantined entries",
    )?;
    let shown = kernel.retrieve(
        "",
        RetrieveOptions {
            include_quarantined: true,
            ..RetrieveOptions::default()
        },
    );
    ensure(
        shown.iter().any(|e| e.id == id),
        "include_quarantined must reveal the entry",
    )?;

    let entry = kernel.rehabilitate(id).map_err(|e| e.to_string())?;
    ensure(
        entry.state == MemoryState::Committed,
        "rehabilitated entry should be committed",
    )?;
    let committed_events = kernel.query_events(&EventQuery {
        kinds: Some(vec![EventKind::MemoryCommitted]),
        ..EventQuery::default()
    });
    ensure(
        committed_events
            .iter()
            .any(|e| e.payload["rehabilitated"] == serde_json::Value::Bool(true)),
        "rehabilitation must emit memory.committed with the marker",
    )
}

/// A tool output leaks a forbidden term: the auditor fires critical, safe
/// mode trips, the next non-read-only call is refused, and operator exit
/// restores normal operation.
async fn drift_hard_violation() -> ScenarioResult {
    let mut config = KernelConfig::default();
    config.approval.auto_approve_sources = vec!["planner".to_owned()];

    let identity = IdentityDescriptor {
        version: 0,
        hash: String::new(),
        persona: PersonaProfile {
            summary: "careful assistant".to_owned(),
            allowed_topics: vec!["notes".to_owned()],
        },
        communication_style: "concise notes".to_owned(),
        soft_preferences: vec![],
        hard_constraints: vec![HardConstraint {
            id: "no-private-keys".to_owned(),
            description: "never reveal private keys".to_owned(),
            forbidden_terms: vec!["private key".to_owned()],
        }],
    };

    let kernel = KernelHandle::builder(config)
        .identity(identity)
        .tool(
            open_contract("leak", true, ApprovalPolicy::AutoIfReadOnly),
            Arc::new(FnTool(|_call: &ToolCall| {
                Ok(serde_json::json!({"text": "sure, the private key is hunter2"}))
            })),
        )
        .tool(
            open_contract("write_note", false, ApprovalPolicy::SourceTrusted),
            Arc::new(FnTool(|_call: &ToolCall| {
                Ok(serde_json::json!({"written": true}))
            })),
        )
        .build()
        .map_err(|e| e.to_string())?;
    kernel.start();

    let outcome = kernel
        .run_plan(
            vec![step(0, "leak", serde_json::json!({}))],
            CallSource::Planner,
        )
        .await
        .map_err(|e| e.to_string())?;
    ensure(
        outcome.state == EpisodeState::SafeMode,
        "leaking episode should end in safe_mode",
    )?;
    ensure(kernel.status().safe_mode, "safe mode should be active")?;

    let drift_events = kernel.query_events(&EventQuery {
        kinds: Some(vec![EventKind::DriftExceeded]),
        ..EventQuery::default()
    });
    ensure(
        drift_events
            .iter()
            .any(|e| e.payload["severity"] == "critical"),
        "hard violation must fire critical drift.exceeded",
    )?;

    // Non-read-only call refused while safe mode is active.
    let refused = kernel
        .run_plan(
            vec![step(0, "write_note", serde_json::json!({}))],
            CallSource::Planner,
        )
        .await
        .map_err(|e| e.to_string())?;
    ensure(
        refused.state == EpisodeState::Failed,
        "non-read-only call should fail under safe mode",
    )?;
    let failed = kernel
        .get_episode(refused.episode_id)
        .into_iter()
        .find(|e| e.kind == EventKind::CallFailed)
        .ok_or("expected call.failed under safe mode")?;
    ensure(
        failed.payload["reason"]
            .as_str()
            .unwrap_or("")
            .contains("safe mode"),
        "failure reason must be SafeModeActive",
    )?;

    // Operator exit restores normal operation.
    kernel.exit_safe_mode();
    let restored = kernel
        .run_plan(
            vec![step(0, "write_note", serde_json::json!({}))],
            CallSource::Planner,
        )
        .await
        .map_err(|e| e.to_string())?;
    ensure(
        restored.state == EpisodeState::Done,
        "write should succeed after safe-mode exit",
    )
}

/// `send_tx` succeeds but its post-condition fails: the compensation runs
/// and the episode fails, in order.
async fn compensation_on_postcond_fail() -> ScenarioResult {
    let mut config = KernelConfig::default();
    config.approval.auto_approve_sources = vec!["planner".to_owned()];

    let mut contract = open_contract("send_tx", false, ApprovalPolicy::SourceTrusted);
    contract.post_conditions = vec!["tx.confirmed".to_owned()];
    contract.compensation_id = Some("refund_tx".to_owned());

    let kernel = KernelHandle::builder(config)
        .post_condition(
            "tx.confirmed",
            crate::kernel::postcond::fn_check(|_call, result| {
                let confirmed = result
                    .output
                    .as_ref()
                    .and_then(|o| o.get("confirmed"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if confirmed {
                    CheckOutcome::pass()
                } else {
                    CheckOutcome::fail("transaction not confirmed")
                }
            }),
        )
        .tool(
            contract,
            Arc::new(FnTool(|_call: &ToolCall| {
                Ok(serde_json::json!({"confirmed": false, "tx": "0xabc"}))
            })),
        )
        .compensation(
            "refund_tx",
            crate::kernel::compensation::fn_compensation(|_call, _result| Ok(())),
        )
        .build()
        .map_err(|e| e.to_string())?;
    kernel.start();

    let outcome = kernel
        .run_plan(
            vec![step(0, "send_tx", serde_json::json!({"amount": 5}))],
            CallSource::Planner,
        )
        .await
        .map_err(|e| e.to_string())?;
    ensure(
        outcome.state == EpisodeState::Failed,
        "episode should be failed",
    )?;

    let events = kernel.get_episode(outcome.episode_id);
    let seq_of = |kind: EventKind| -> Result<u64, String> {
        events
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.seq)
            .ok_or(format!("expected {kind}"))
    };
    let succeeded = seq_of(EventKind::CallSucceeded)?;
    let postcond = seq_of(EventKind::PostcondFailed)?;
    let compensation = seq_of(EventKind::CompensationRun)?;
    let failed = seq_of(EventKind::CallFailed)?;
    ensure(
        succeeded < postcond && postcond < compensation && compensation < failed,
        "event order must be succeeded < postcond.failed < compensation.run < call.failed",
    )
}

/// Two plans under `max_concurrent = 1` never interleave in the log.
async fn concurrent_plans_serialize() -> ScenarioResult {
    let kernel = KernelHandle::builder(KernelConfig::default())
        .build()
        .map_err(|e| e.to_string())?;
    kernel.start();

    let k1 = kernel.clone();
    let k2 = kernel.clone();
    let first = tokio::spawn(async move {
        k1.run_plan(
            vec![step(0, "echo", serde_json::json!({"msg": "first"}))],
            CallSource::Planner,
        )
        .await
    });
    let second = tokio::spawn(async move {
        k2.run_plan(
            vec![step(0, "echo", serde_json::json!({"msg": "second"}))],
            CallSource::Planner,
        )
        .await
    });

    let first = first
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
    let second = second
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

    ensure(
        first.state == EpisodeState::Done && second.state == EpisodeState::Done,
        "both episodes should complete",
    )?;

    let bounds = |episode_id: uuid::Uuid| -> Result<(u64, u64), String> {
        let events = kernel.get_episode(episode_id);
        let min = events.iter().map(|e| e.seq).min().ok_or("no events")?;
        let max = events.iter().map(|e| e.seq).max().ok_or("no events")?;
        Ok((min, max))
    };
    let (a_min, a_max) = bounds(first.episode_id)?;
    let (b_min, b_max) = bounds(second.episode_id)?;
    ensure(
        a_max < b_min || b_max < a_min,
        "episodes must not interleave under max_concurrent=1",
    )
}
