#![allow(missing_docs)]

// End-to-end kernel scenarios: a composed kernel with in-memory stores,
// driven through the control-plane paths the platform relies on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use straylight::config::KernelConfig;
use straylight::kernel::event_store::EventQuery;
use straylight::kernel::handle::KernelHandle;
use straylight::kernel::memory::RetrieveOptions;
use straylight::kernel::registry::{ToolError, ToolHandler};
use straylight::types::{
    ApprovalPolicy, CallSource, EpisodeState, EventKind, IdentityPatch, MemoryCandidate,
    MemoryState, PlanStep, Provenance, RollbackPolicy, ToolCall, ToolContract,
};

// ── Fixtures ──

struct EchoLike(serde_json::Value);

#[async_trait]
impl ToolHandler for EchoLike {
    async fn invoke(&self, _call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        Ok(self.0.clone())
    }
}

struct SlowTool;

#[async_trait]
impl ToolHandler for SlowTool {
    async fn invoke(&self, _call: &ToolCall) -> Result<serde_json::Value, ToolError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(serde_json::json!({}))
    }
}

fn contract(id: &str, read_only: bool, policy: ApprovalPolicy) -> ToolContract {
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

fn plan_step(index: usize, tool_id: &str, input: serde_json::Value) -> PlanStep {
    PlanStep {
        step_index: index,
        tool_id: tool_id.to_owned(),
        input,
        justification: "integration test step".to_owned(),
        rollback_policy: RollbackPolicy::Attempt,
    }
}

fn trusted_planner_config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.approval.auto_approve_sources = vec!["planner".to_owned()];
    config
}

fn started(kernel: KernelHandle) -> KernelHandle {
    kernel.start();
    kernel
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Event ordering ──

/// Events of one episode carry strictly increasing seq values, and a
/// two-step plan loops committing → planning → … → done.
#[tokio::test]
async fn multi_step_episode_events_are_ordered() {
    let kernel = started(
        KernelHandle::builder(KernelConfig::default())
            .build()
            .expect("kernel builds"),
    );

    let outcome = kernel
        .run_plan(
            vec![
                plan_step(0, "echo", serde_json::json!({"msg": "one"})),
                plan_step(1, "echo", serde_json::json!({"msg": "two"})),
            ],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");

    assert_eq!(outcome.state, EpisodeState::Done);
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps.iter().all(straylight::kernel::pipeline::StepOutcome::ok));

    let events = kernel.get_episode(outcome.episode_id);
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert!(
            pair[0].seq < pair[1].seq,
            "seq must be strictly increasing within an episode"
        );
    }
    assert_eq!(events[0].kind, EventKind::PlanEmitted);

    let succeeded = events
        .iter()
        .filter(|e| e.kind == EventKind::CallSucceeded)
        .count();
    assert_eq!(succeeded, 2, "both steps succeed");
}

// ── Approval conservation ──

/// Every approval request gets exactly one terminal decision.
#[tokio::test]
async fn approval_requests_resolve_exactly_once() {
    let mut config = KernelConfig::default();
    config.approval.timeout_ms = 50;
    let kernel = started(
        KernelHandle::builder(config)
            .tool(
                contract("deploy", false, ApprovalPolicy::Always),
                Arc::new(EchoLike(serde_json::json!({"deployed": true}))),
            )
            .build()
            .expect("kernel builds"),
    );

    let outcome = kernel
        .run_plan(
            vec![plan_step(0, "deploy", serde_json::json!({}))],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");
    assert_eq!(outcome.state, EpisodeState::Failed);

    let events = kernel.get_episode(outcome.episode_id);
    let requested = events
        .iter()
        .filter(|e| e.kind == EventKind::CallApprovalRequested)
        .count();
    let approved = events
        .iter()
        .filter(|e| e.kind == EventKind::CallApproved)
        .count();
    let denied = events
        .iter()
        .filter(|e| e.kind == EventKind::CallDenied)
        .count();
    assert_eq!(requested, 1);
    assert_eq!(
        approved.saturating_add(denied),
        1,
        "exactly one terminal decision per request"
    );
}

/// An operator approval unblocks the waiting pipeline and the episode
/// completes.
#[tokio::test]
async fn operator_approval_unblocks_episode() {
    let kernel = started(
        KernelHandle::builder(KernelConfig::default())
            .tool(
                contract("deploy", false, ApprovalPolicy::Always),
                Arc::new(EchoLike(serde_json::json!({"deployed": true}))),
            )
            .build()
            .expect("kernel builds"),
    );

    let runner = kernel.clone();
    let episode = tokio::spawn(async move {
        runner
            .run_plan(
                vec![plan_step(0, "deploy", serde_json::json!({}))],
                CallSource::User,
            )
            .await
    });

    let approver = kernel.clone();
    wait_for("pending approval", move || {
        approver.list_pending().len() == 1
    })
    .await;

    let pending = kernel.list_pending();
    kernel
        .approve(pending[0].call.call_id, "operator")
        .expect("approve");

    let outcome = episode
        .await
        .expect("task joins")
        .expect("plan runs");
    assert_eq!(outcome.state, EpisodeState::Done);

    let log = kernel
        .journal()
        .approval_log_entry(pending[0].call.call_id)
        .expect("journal query")
        .expect("approval row exists");
    assert_eq!(log.decision.as_deref(), Some("approved"));
    assert_eq!(log.actor.as_deref(), Some("operator"));
}

// ── Schema enforcement ──

/// Bad input never reaches the tool: call.validated carries the error and
/// the episode fails with no call.started.
#[tokio::test]
async fn input_schema_violation_stops_step() {
    let kernel = started(
        KernelHandle::builder(KernelConfig::default())
            .build()
            .expect("kernel builds"),
    );

    let outcome = kernel
        .run_plan(
            vec![plan_step(0, "echo", serde_json::json!({"msg": 42}))],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");
    assert_eq!(outcome.state, EpisodeState::Failed);

    let events = kernel.get_episode(outcome.episode_id);
    let validated = events
        .iter()
        .find(|e| e.kind == EventKind::CallValidated)
        .expect("call.validated present");
    assert_eq!(validated.payload["ok"], serde_json::Value::Bool(false));
    assert!(
        !events.iter().any(|e| e.kind == EventKind::CallStarted),
        "tool must not start on invalid input"
    );
}

// ── Timeouts and cancellation ──

/// A tool that outlives its deadline fails with tool_timeout and its
/// compensation runs.
#[tokio::test]
async fn tool_timeout_triggers_compensation() {
    let mut slow = contract("slow_write", false, ApprovalPolicy::SourceTrusted);
    slow.timeout_ms = 50;
    slow.compensation_id = Some("undo_slow".to_owned());

    let kernel = started(
        KernelHandle::builder(trusted_planner_config())
            .tool(slow, Arc::new(SlowTool))
            .compensation(
                "undo_slow",
                straylight::kernel::compensation::fn_compensation(|_call, _result| Ok(())),
            )
            .build()
            .expect("kernel builds"),
    );

    let outcome = kernel
        .run_plan(
            vec![plan_step(0, "slow_write", serde_json::json!({}))],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");

    assert_eq!(outcome.state, EpisodeState::Failed);
    assert!(outcome.steps[0].compensated);

    let events = kernel.get_episode(outcome.episode_id);
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::CallFailed)
        .expect("call.failed present");
    assert!(
        failed.payload["reason"]
            .as_str()
            .unwrap_or("")
            .contains("timeout"),
        "failure reason must mention the timeout"
    );
    assert!(events.iter().any(|e| e.kind == EventKind::CompensationRun));
}

/// Cancelling an episode mid-execution rolls the step back.
#[tokio::test]
async fn cancellation_runs_compensation() {
    let mut slow = contract("slow_write", false, ApprovalPolicy::SourceTrusted);
    slow.timeout_ms = 60_000;
    slow.compensation_id = Some("undo_slow".to_owned());

    let kernel = started(
        KernelHandle::builder(trusted_planner_config())
            .tool(slow, Arc::new(SlowTool))
            .compensation(
                "undo_slow",
                straylight::kernel::compensation::fn_compensation(|_call, _result| Ok(())),
            )
            .build()
            .expect("kernel builds"),
    );

    let episode_id = kernel
        .submit_plan(
            vec![plan_step(0, "slow_write", serde_json::json!({}))],
            CallSource::Planner,
        )
        .expect("submit");

    let watcher = kernel.clone();
    wait_for("call.started", move || {
        watcher
            .get_episode(episode_id)
            .iter()
            .any(|e| e.kind == EventKind::CallStarted)
    })
    .await;

    assert!(kernel.cancel_episode(episode_id), "episode is in flight");

    let watcher = kernel.clone();
    wait_for("compensation after cancel", move || {
        let events = watcher.get_episode(episode_id);
        events.iter().any(|e| e.kind == EventKind::CompensationRun)
            && events.iter().any(|e| e.kind == EventKind::CallFailed)
    })
    .await;
}

// ── Safe mode ──

/// While safe mode is active, no non-read-only tool ever succeeds, and
/// read-only tools keep working.
#[tokio::test]
async fn safe_mode_blocks_writes_only() {
    let kernel = started(
        KernelHandle::builder(trusted_planner_config())
            .tool(
                contract("write_note", false, ApprovalPolicy::SourceTrusted),
                Arc::new(EchoLike(serde_json::json!({"written": true}))),
            )
            .build()
            .expect("kernel builds"),
    );

    kernel.enter_safe_mode("operator drill");

    let write = kernel
        .run_plan(
            vec![plan_step(0, "write_note", serde_json::json!({}))],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");
    assert_eq!(write.state, EpisodeState::Failed);

    let read = kernel
        .run_plan(
            vec![plan_step(0, "echo", serde_json::json!({"msg": "still here"}))],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");
    assert_eq!(read.state, EpisodeState::Done, "read-only calls still serve");

    // No call.succeeded for the write while safe mode was up.
    let write_events = kernel.get_episode(write.episode_id);
    assert!(
        !write_events.iter().any(|e| e.kind == EventKind::CallSucceeded),
        "non-read-only tools must not succeed in safe mode"
    );

    kernel.exit_safe_mode();
    let after = kernel
        .run_plan(
            vec![plan_step(0, "write_note", serde_json::json!({}))],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");
    assert_eq!(after.state, EpisodeState::Done);
}

// ── Memory laws ──

/// After supersede, default retrieval never returns the superseded entry.
#[tokio::test]
async fn supersede_hides_old_entry_from_retrieval() {
    let kernel = started(
        KernelHandle::builder(KernelConfig::default())
            .build()
            .expect("kernel builds"),
    );

    let candidate = |content: &str| MemoryCandidate {
        kind: "fact".to_owned(),
        content: content.to_owned(),
        embedding: None,
        source: "user".to_owned(),
        provenance: Provenance::UserTyped,
        corroboration: 0,
        observed_at: Utc::now(),
    };

    let old = kernel.memory().admit(candidate("office is in berlin"));
    assert_eq!(old.state, MemoryState::Committed);
    let old_id = old.id.expect("id");

    kernel
        .memory()
        .supersede(old_id, candidate("office is in lisbon"))
        .expect("supersede");

    let entries = kernel.retrieve("office", RetrieveOptions::default());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].content, "office is in lisbon");
    assert!(entries.iter().all(|e| e.id != old_id));
}

// ── Identity ──

/// Updates bump the version by exactly one and always change the hash.
#[tokio::test]
async fn identity_version_is_monotone() {
    let kernel = started(
        KernelHandle::builder(KernelConfig::default())
            .build()
            .expect("kernel builds"),
    );

    let mut previous = kernel.get_identity();
    for (index, style) in ["terse", "warm", "formal"].iter().enumerate() {
        let updated = kernel.update_identity(IdentityPatch {
            communication_style: Some((*style).to_owned()),
            ..IdentityPatch::default()
        });
        assert_eq!(
            updated.version,
            previous.version.saturating_add(1),
            "update {index} must bump by one"
        );
        assert_ne!(updated.hash, previous.hash);
        previous = updated;
    }

    let journaled = kernel
        .journal()
        .latest_identity()
        .expect("journal query")
        .expect("identity persisted");
    assert_eq!(journaled.version, previous.version);
}

// ── In-process planner ──

/// A scripted planner drains into one episode per emitted plan.
#[tokio::test]
async fn scripted_planner_runs_each_plan() {
    use std::sync::Mutex;
    use straylight::kernel::orchestrator::Planner;

    struct ScriptedPlanner {
        plans: Mutex<Vec<Vec<PlanStep>>>,
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn next_plan(&self) -> Option<Vec<PlanStep>> {
            self.plans.lock().expect("test lock").pop()
        }
    }

    let kernel = started(
        KernelHandle::builder(KernelConfig::default())
            .build()
            .expect("kernel builds"),
    );

    let planner = ScriptedPlanner {
        plans: Mutex::new(vec![
            vec![plan_step(0, "echo", serde_json::json!({"msg": "b"}))],
            vec![plan_step(0, "echo", serde_json::json!({"msg": "a"}))],
        ]),
    };

    let outcomes = kernel
        .drive_planner(&planner, CallSource::Planner)
        .await
        .expect("planner drains");
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.state == EpisodeState::Done));
}

// ── Journal write-through ──

/// Every kernel event lands in the journal's events table.
#[tokio::test]
async fn events_mirror_into_journal() {
    let kernel = started(
        KernelHandle::builder(KernelConfig::default())
            .build()
            .expect("kernel builds"),
    );

    kernel
        .run_plan(
            vec![plan_step(0, "echo", serde_json::json!({"msg": "hi"}))],
            CallSource::Planner,
        )
        .await
        .expect("plan runs");

    let in_memory = kernel.query_events(&EventQuery::default()).len();
    let journaled = kernel.journal().event_count().expect("count");
    assert_eq!(journaled, u64::try_from(in_memory).expect("fits"));
}
