//! Kernel assembly and the explicit handle passed to request handlers.
//!
//! The kernel is one logical instance per process. [`KernelBuilder`] wires
//! the components in dependency order, restores journaled state, registers
//! built-in and user tools, and validates everything that is fatal at
//! startup. [`KernelHandle`] is the only way in: a cheap clone over an
//! `Arc`, exposing the control-surface verbs. No global mutable state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::kernel::approval::{ApprovalError, ApprovalGate, PendingApproval};
use crate::kernel::compensation::{CompensationError, CompensationHandler, CompensationRegistry};
use crate::kernel::drift::{DriftMonitor, DriftVerdict};
use crate::kernel::event_store::{EventQuery, EventStore, JsonlSink};
use crate::kernel::goals::{GoalError, GoalManager, GoalPatch, NewGoal, NewTodo};
use crate::kernel::invariants::{Checkpoint, InvariantChecker, InvariantViolation};
use crate::kernel::journal::Journal;
use crate::kernel::memory::{MemoryError, MemoryGate, RetrieveOptions};
use crate::kernel::orchestrator::{EpisodeOutcome, RoleOrchestrator};
use crate::kernel::pipeline::ExecutionPipeline;
use crate::kernel::postcond::{PostCondition, PostConditionVerifier, VerifierError};
use crate::kernel::registry::{RegistryError, ToolHandler, ToolRegistry};
use crate::kernel::safe_mode::{SafeModeController, SafeModeState};
use crate::kernel::schema::{SchemaError, SchemaValidator};
use crate::kernel::trust::TrustScorer;
use crate::tools;
use crate::types::{
    CallSource, Event, EventKind, Goal, HardConstraint, IdentityDescriptor, IdentityPatch,
    MemoryEntry, PersonaProfile, PlanStep, Todo,
};

/// Interval for the approval-expiry sweep while the kernel runs.
const SWEEP_INTERVAL_SECS: u64 = 10;

/// Errors surfaced by kernel assembly and the control surface.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Invalid configuration; fatal at startup.
    #[error("config invalid: {0}")]
    ConfigInvalid(String),
    /// Journal could not be opened or read at startup.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    #[error(transparent)]
    Compensation(#[from] CompensationError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Goals(#[from] GoalError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    /// Kernel is not accepting plans (stopped or paused).
    #[error("kernel is not running")]
    NotRunning,
}

/// Coarse process lifecycle, distinct from per-episode states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub state: LifecycleState,
    pub safe_mode: bool,
    pub agent_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
}

/// Builds a kernel from config plus user tools, checks, and compensations.
pub struct KernelBuilder {
    config: KernelConfig,
    post_conditions: Vec<(String, Arc<dyn PostCondition>)>,
    tools: Vec<(crate::types::ToolContract, Arc<dyn ToolHandler>)>,
    compensations: Vec<(String, Arc<dyn CompensationHandler>)>,
    identity: Option<IdentityDescriptor>,
    audit_path: Option<PathBuf>,
    builtins: bool,
}

impl KernelBuilder {
    /// Start a builder over a validated-later config.
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            post_conditions: Vec::new(),
            tools: Vec::new(),
            compensations: Vec::new(),
            identity: None,
            audit_path: None,
            builtins: true,
        }
    }

    /// Register a named post-condition check.
    pub fn post_condition(mut self, id: impl Into<String>, check: Arc<dyn PostCondition>) -> Self {
        self.post_conditions.push((id.into(), check));
        self
    }

    /// Register a tool contract and handler.
    pub fn tool(
        mut self,
        contract: crate::types::ToolContract,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        self.tools.push((contract, handler));
        self
    }

    /// Register a compensation handler.
    pub fn compensation(
        mut self,
        id: impl Into<String>,
        handler: Arc<dyn CompensationHandler>,
    ) -> Self {
        self.compensations.push((id.into(), handler));
        self
    }

    /// Seed the identity descriptor (ignored when the journal has one).
    pub fn identity(mut self, identity: IdentityDescriptor) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Mirror every event to a JSONL audit file.
    pub fn audit_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_path = Some(path.into());
        self
    }

    /// Skip built-in tool registration (harness and tests).
    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    /// Assemble the kernel. Everything fatal at startup fails here.
    pub fn build(self) -> Result<KernelHandle, KernelError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| KernelError::ConfigInvalid(e.to_string()))?;

        let journal = Arc::new(
            Journal::open(&config.journal.path)
                .map_err(|e| KernelError::PersistenceUnavailable(e.to_string()))?,
        );

        let events = Arc::new(EventStore::new(config.event_store));
        events.attach_sink(journal.clone());
        if let Some(path) = &self.audit_path {
            let sink = JsonlSink::new(path)
                .map_err(|e| KernelError::PersistenceUnavailable(e.to_string()))?;
            events.attach_sink(Arc::new(sink));
        }

        let scorer = TrustScorer::new(&config.trust);
        let memory = Arc::new(
            MemoryGate::new(scorer, config.memory.admit_tier, events.clone())
                .with_journal(journal.clone()),
        );
        let restored = journal
            .load_memory_entries()
            .map_err(|e| KernelError::PersistenceUnavailable(e.to_string()))?;
        memory.restore(restored);

        let journaled_identity = journal
            .latest_identity()
            .map_err(|e| KernelError::PersistenceUnavailable(e.to_string()))?;
        let drift = Arc::new(match journaled_identity {
            Some(descriptor) => {
                DriftMonitor::resume(descriptor, config.drift_monitor.clone(), events.clone())
                    .with_journal(journal.clone())
            }
            None => {
                let initial = self.identity.unwrap_or_else(default_identity);
                let monitor =
                    DriftMonitor::new(initial, config.drift_monitor.clone(), events.clone())
                        .with_journal(journal.clone());
                if let Err(e) = journal.insert_identity_version(&monitor.identity()) {
                    warn!(error = %e, "failed to journal initial identity");
                }
                monitor
            }
        });

        let goals = Arc::new(GoalManager::new().with_journal(journal.clone()));
        let journaled_goals = journal
            .load_goals()
            .map_err(|e| KernelError::PersistenceUnavailable(e.to_string()))?;
        goals.restore(journaled_goals);

        let mut verifier = PostConditionVerifier::new(config.tools.check_timeout_ms);
        for (id, check) in self.post_conditions {
            verifier.register(id, check)?;
        }

        let mut registry = ToolRegistry::new();
        let plugin_state = tools::PluginState::new();
        if self.builtins {
            let (contract, handler) = tools::echo();
            registry.register(contract, handler, &verifier)?;
            let (contract, handler) = tools::restart_agent();
            registry.register(contract, handler, &verifier)?;
            let (contract, handler) = tools::plugin_toggle(plugin_state.clone());
            registry.register(contract, handler, &verifier)?;
            let (contract, handler) = tools::memory_write(memory.clone());
            registry.register(contract, handler, &verifier)?;
        }
        for (contract, handler) in self.tools {
            registry.register(contract, handler, &verifier)?;
        }

        let mut compensations = CompensationRegistry::new(events.clone());
        if self.builtins {
            compensations.register_fn(
                tools::PLUGIN_TOGGLE_REVERT,
                tools::plugin_toggle_revert(plugin_state.clone()),
            )?;
        }
        for (id, handler) in self.compensations {
            compensations.register(id, handler)?;
        }

        // A named compensation that does not resolve is a config error, not
        // a runtime surprise.
        for contract in registry.list() {
            if let Some(compensation_id) = &contract.compensation_id {
                if !compensations.contains(compensation_id) {
                    return Err(KernelError::ConfigInvalid(format!(
                        "tool '{}' names unknown compensation '{}'",
                        contract.id, compensation_id
                    )));
                }
            }
        }

        let registry = Arc::new(registry);
        let validator = Arc::new(SchemaValidator::new(&registry)?);
        let verifier = Arc::new(verifier);
        let compensations = Arc::new(compensations);

        let approvals = Arc::new(
            ApprovalGate::new(config.approval.clone(), events.clone())
                .with_journal(journal.clone()),
        );
        let safe_mode = Arc::new(SafeModeController::new(events.clone()));
        let invariants = Arc::new(InvariantChecker::new(
            memory.clone(),
            drift.clone(),
            approvals.clone(),
            events.clone(),
            config.trust.thresholds.quarantine,
            config.invariants.enabled,
        ));

        let pipeline = Arc::new(ExecutionPipeline::new(
            registry.clone(),
            validator,
            approvals.clone(),
            verifier,
            invariants.clone(),
            memory.clone(),
            compensations,
            safe_mode.clone(),
            events.clone(),
            config.workflow.default_timeout_ms,
        ));
        let orchestrator = Arc::new(RoleOrchestrator::new(
            pipeline,
            drift.clone(),
            invariants.clone(),
            safe_mode.clone(),
            events.clone(),
            config.workflow.max_concurrent,
        ));

        let agent_name = config.agent.name.clone();
        Ok(KernelHandle {
            inner: Arc::new(Kernel {
                agent_name,
                events,
                journal,
                registry,
                memory,
                drift,
                goals,
                approvals,
                invariants,
                safe_mode,
                orchestrator,
                lifecycle: Mutex::new(LifecycleState::Created),
                started_at: Mutex::new(None),
                sweeper: Mutex::new(None),
            }),
        })
    }
}

/// The composed kernel. Private to the handle.
pub struct Kernel {
    agent_name: String,
    events: Arc<EventStore>,
    journal: Arc<Journal>,
    registry: Arc<ToolRegistry>,
    memory: Arc<MemoryGate>,
    drift: Arc<DriftMonitor>,
    goals: Arc<GoalManager>,
    approvals: Arc<ApprovalGate>,
    invariants: Arc<InvariantChecker>,
    safe_mode: Arc<SafeModeController>,
    orchestrator: Arc<RoleOrchestrator>,
    lifecycle: Mutex<LifecycleState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Cheap, cloneable handle over the kernel; the only entry point request
/// handlers receive.
#[derive(Clone)]
pub struct KernelHandle {
    inner: Arc<Kernel>,
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("agent_name", &self.inner.agent_name)
            .field("state", &self.lifecycle())
            .finish()
    }
}

impl KernelHandle {
    /// Entry point for assembly.
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    // ── Lifecycle ──

    /// Mark the kernel running, emit `kernel.up`, start the approval sweep.
    pub fn start(&self) {
        {
            let mut lifecycle = self.lock_lifecycle();
            if *lifecycle == LifecycleState::Running {
                return;
            }
            *lifecycle = LifecycleState::Running;
        }
        {
            let mut started_at = self.lock_started_at();
            *started_at = Some(Utc::now());
        }

        info!(agent = %self.inner.agent_name, "kernel up");
        self.inner.events.append(
            EventKind::KernelUp,
            None,
            serde_json::json!({"agent_name": self.inner.agent_name}),
        );

        let approvals = self.inner.approvals.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let swept = approvals.cleanup_expired();
                if swept > 0 {
                    warn!(swept, "expired approval requests auto-denied");
                }
            }
        });
        let mut slot = self.lock_sweeper();
        if let Some(old) = slot.replace(sweeper) {
            old.abort();
        }
    }

    /// Emit `kernel.down`, stop the sweep, mark stopped.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.lock_lifecycle();
            if *lifecycle == LifecycleState::Stopped {
                return;
            }
            *lifecycle = LifecycleState::Stopped;
        }
        if let Some(sweeper) = self.lock_sweeper().take() {
            sweeper.abort();
        }

        info!(agent = %self.inner.agent_name, "kernel down");
        self.inner.events.append(
            EventKind::KernelDown,
            None,
            serde_json::json!({"agent_name": self.inner.agent_name}),
        );
    }

    /// Stop accepting plans without shutting down.
    pub fn pause(&self) {
        let mut lifecycle = self.lock_lifecycle();
        if *lifecycle == LifecycleState::Running {
            *lifecycle = LifecycleState::Paused;
        }
    }

    /// Resume accepting plans.
    pub fn resume(&self) {
        let mut lifecycle = self.lock_lifecycle();
        if *lifecycle == LifecycleState::Paused {
            *lifecycle = LifecycleState::Running;
        }
    }

    /// Stop, then start.
    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    /// Operator reset: exit safe mode and accept plans again.
    pub fn reset(&self) {
        self.inner.safe_mode.exit("operator_reset");
        let mut lifecycle = self.lock_lifecycle();
        if *lifecycle != LifecycleState::Stopped {
            *lifecycle = LifecycleState::Running;
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> KernelStatus {
        let started_at = *self.lock_started_at();
        let uptime_ms = started_at
            .map(|t| {
                u64::try_from(Utc::now().signed_duration_since(t).num_milliseconds().max(0))
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        KernelStatus {
            state: self.lifecycle(),
            safe_mode: self.inner.safe_mode.is_active(),
            agent_name: self.inner.agent_name.clone(),
            started_at,
            uptime_ms,
        }
    }

    // ── Plans ──

    /// Submit a plan for asynchronous execution; returns the episode ID
    /// immediately. The episode waits for pipeline capacity.
    pub fn submit_plan(
        &self,
        steps: Vec<PlanStep>,
        source: CallSource,
    ) -> Result<Uuid, KernelError> {
        if self.lifecycle() != LifecycleState::Running {
            return Err(KernelError::NotRunning);
        }
        let episode_id = Uuid::new_v4();
        let orchestrator = self.inner.orchestrator.clone();
        tokio::spawn(async move {
            let outcome = orchestrator.run_episode(episode_id, steps, source).await;
            info!(episode_id = %episode_id, state = %outcome.state, "episode finished");
        });
        Ok(episode_id)
    }

    /// Run a plan to completion (harness and tests).
    pub async fn run_plan(
        &self,
        steps: Vec<PlanStep>,
        source: CallSource,
    ) -> Result<EpisodeOutcome, KernelError> {
        if self.lifecycle() != LifecycleState::Running {
            return Err(KernelError::NotRunning);
        }
        Ok(self
            .inner
            .orchestrator
            .run_episode(Uuid::new_v4(), steps, source)
            .await)
    }

    /// Drain an in-process plan producer, one episode per plan.
    pub async fn drive_planner(
        &self,
        planner: &dyn crate::kernel::orchestrator::Planner,
        source: CallSource,
    ) -> Result<Vec<EpisodeOutcome>, KernelError> {
        if self.lifecycle() != LifecycleState::Running {
            return Err(KernelError::NotRunning);
        }
        Ok(self
            .inner
            .orchestrator
            .run_from_planner(planner, source)
            .await)
    }

    /// Full event slice for one episode.
    pub fn get_episode(&self, episode_id: Uuid) -> Vec<Event> {
        self.inner.events.episode_slice(episode_id)
    }

    /// Cancel an in-flight episode.
    pub fn cancel_episode(&self, episode_id: Uuid) -> bool {
        self.inner.orchestrator.cancel_episode(episode_id)
    }

    // ── Approvals ──

    /// Requests awaiting an operator decision.
    pub fn list_pending(&self) -> Vec<PendingApproval> {
        self.inner.approvals.list()
    }

    /// Approve a pending call.
    pub fn approve(&self, call_id: Uuid, actor: &str) -> Result<(), KernelError> {
        Ok(self.inner.approvals.approve(call_id, actor)?)
    }

    /// Deny a pending call.
    pub fn deny(&self, call_id: Uuid, actor: &str, reason: &str) -> Result<(), KernelError> {
        Ok(self.inner.approvals.deny(call_id, actor, reason)?)
    }

    // ── Goals ──

    /// Create a goal.
    pub fn create_goal(&self, new: NewGoal) -> Result<Goal, KernelError> {
        Ok(self.inner.goals.create_goal(new)?)
    }

    /// Patch a goal.
    pub fn update_goal(&self, id: Uuid, patch: GoalPatch) -> Result<Goal, KernelError> {
        Ok(self.inner.goals.update_goal(id, patch)?)
    }

    /// Complete a goal.
    pub fn complete_goal(&self, id: Uuid) -> Result<Goal, KernelError> {
        Ok(self.inner.goals.complete_goal(id)?)
    }

    /// Reopen a goal.
    pub fn reopen_goal(&self, id: Uuid) -> Result<Goal, KernelError> {
        Ok(self.inner.goals.reopen_goal(id)?)
    }

    /// Delete a goal.
    pub fn delete_goal(&self, id: Uuid) -> Result<(), KernelError> {
        Ok(self.inner.goals.delete_goal(id)?)
    }

    /// Goals sorted by (priority asc, created_at desc).
    pub fn list_goals(&self) -> Vec<Goal> {
        self.inner.goals.list_goals()
    }

    /// Create a todo.
    pub fn create_todo(&self, new: NewTodo) -> Result<Todo, KernelError> {
        Ok(self.inner.goals.create_todo(new)?)
    }

    /// Complete a todo.
    pub fn complete_todo(&self, id: Uuid) -> Result<Todo, KernelError> {
        Ok(self.inner.goals.complete_todo(id)?)
    }

    /// Todos sorted by (urgent desc, priority asc, name asc).
    pub fn list_todos(&self) -> Vec<Todo> {
        self.inner.goals.list_todos()
    }

    // ── Memory ──

    /// Ranked retrieval over committed memory.
    pub fn retrieve(&self, query: &str, opts: RetrieveOptions) -> Vec<MemoryEntry> {
        self.inner.memory.retrieve(query, opts)
    }

    /// Move a quarantined entry to committed.
    pub fn rehabilitate(&self, id: Uuid) -> Result<MemoryEntry, KernelError> {
        Ok(self.inner.memory.rehabilitate(id)?)
    }

    /// IDs currently in quarantine.
    pub fn quarantine_list(&self) -> Vec<Uuid> {
        self.inner.memory.quarantine_list()
    }

    // ── Identity & drift ──

    /// Current identity descriptor.
    pub fn get_identity(&self) -> IdentityDescriptor {
        self.inner.drift.identity()
    }

    /// Patch the identity: version increments, hash recomputes.
    pub fn update_identity(&self, patch: IdentityPatch) -> IdentityDescriptor {
        self.inner.drift.update_identity(patch)
    }

    /// Feed an agent-authored output to the drift monitor.
    pub fn observe_output(&self, output: &str, episode_id: Option<Uuid>) -> DriftVerdict {
        let verdict = self.inner.drift.observe(output, episode_id);
        if verdict.critical {
            self.inner
                .safe_mode
                .enter("critical persona drift in agent output");
        }
        verdict
    }

    // ── Events ──

    /// Subscribe to the live event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Subscribe with a kind filter, as a stream.
    pub fn subscribe_filtered(
        &self,
        kinds: Vec<EventKind>,
    ) -> impl tokio_stream::Stream<Item = Event> {
        use tokio_stream::StreamExt;
        let rx = self.inner.events.subscribe();
        tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) if kinds.is_empty() || kinds.contains(&event.kind) => Some(event),
            _ => None,
        })
    }

    /// Query retained events.
    pub fn query_events(&self, query: &EventQuery) -> Vec<Event> {
        self.inner.events.query(query)
    }

    // ── Invariants & safe mode ──

    /// Run every invariant now.
    pub fn check_now(&self) -> Vec<InvariantViolation> {
        self.inner.invariants.check(Checkpoint::OnDemand, None)
    }

    /// Trip safe mode.
    pub fn enter_safe_mode(&self, reason: &str) -> bool {
        self.inner.safe_mode.enter(reason)
    }

    /// Exit safe mode.
    pub fn exit_safe_mode(&self) -> bool {
        self.inner.safe_mode.exit("operator")
    }

    /// Safe-mode snapshot.
    pub fn safe_mode_state(&self) -> SafeModeState {
        self.inner.safe_mode.state()
    }

    // ── Component access (harness, tests, transports) ──

    /// The event store.
    pub fn events(&self) -> &Arc<EventStore> {
        &self.inner.events
    }

    /// The journal.
    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    /// The tool registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    /// The memory gate.
    pub fn memory(&self) -> &Arc<MemoryGate> {
        &self.inner.memory
    }

    /// The approval gate.
    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.inner.approvals
    }

    fn lifecycle(&self) -> LifecycleState {
        *self.lock_lifecycle()
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        match self.inner.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_started_at(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        match self.inner.started_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
        match self.inner.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Identity used when neither the journal nor the builder provides one.
fn default_identity() -> IdentityDescriptor {
    IdentityDescriptor {
        version: 0,
        hash: String::new(),
        persona: PersonaProfile {
            summary: "A careful assistant that only acts through approved tools".to_owned(),
            allowed_topics: vec![
                "scheduling tasks goals reminders".to_owned(),
                "memory notes facts".to_owned(),
                "tools plugins status".to_owned(),
            ],
        },
        communication_style: "Concise, factual answers about tasks, goals, memory and tool status"
            .to_owned(),
        soft_preferences: vec!["prefer short answers".to_owned()],
        hard_constraints: vec![HardConstraint {
            id: "no-secret-material".to_owned(),
            description: "never reveal credentials or private keys".to_owned(),
            forbidden_terms: vec![
                "private key".to_owned(),
                "-----BEGIN".to_owned(),
                "api_key=".to_owned(),
            ],
        }],
    }
}
