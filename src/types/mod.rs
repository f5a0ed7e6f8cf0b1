// Core kernel types shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Origin of a candidate tool call or memory fact.
///
/// Used by the approval gate (`source-trusted` policy) and by the trust
/// scorer's provenance signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSource {
    /// Emitted by the plan producer (LLM or rule-based planner).
    Planner,
    /// Typed directly by the human operator.
    User,
    /// A named subsystem eligible for auto-approval.
    Subsystem(String),
}

impl std::fmt::Display for CallSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planner => f.write_str("planner"),
            Self::User => f.write_str("user"),
            Self::Subsystem(name) => write!(f, "subsystem:{name}"),
        }
    }
}

/// Approval requirement attached to a tool contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// No human in the loop.
    None,
    /// Auto-approve iff the contract is read-only and the config switch is on.
    AutoIfReadOnly,
    /// Auto-approve iff the call source is whitelisted.
    SourceTrusted,
    /// Every call waits for an explicit decision.
    Always,
}

/// Immutable contract a tool registers at startup.
///
/// Schemas are declarative JSON Schema documents, compiled once at
/// registration. `post_conditions` name checks that must resolve in the
/// post-condition verifier or registration fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContract {
    /// Unique tool ID (e.g. "echo", "memory.write").
    pub id: String,
    /// Contract version, bumped on any change.
    pub version: u32,
    /// JSON Schema for call input.
    pub input_schema: serde_json::Value,
    /// JSON Schema for tool output.
    pub output_schema: serde_json::Value,
    /// True if the tool has no side effects.
    pub read_only: bool,
    /// When human approval is required.
    pub approval_policy: ApprovalPolicy,
    /// Named post-condition checks that must pass after the tool returns.
    pub post_conditions: Vec<String>,
    /// Compensation handler ID for rollback, if any.
    pub compensation_id: Option<String>,
    /// Tool invocation deadline in milliseconds.
    pub timeout_ms: u64,
}

/// A concrete invocation of a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: Uuid,
    pub tool_id: String,
    pub input: serde_json::Value,
    pub source: CallSource,
    pub episode_id: Uuid,
    pub step_index: usize,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: Uuid,
    pub ok: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set once a compensation has run for this call.
    pub compensated: bool,
}

/// Trust tier derived from a score value by configured thresholds.
///
/// Ordered lowest to highest so tier comparisons read naturally
/// (`tier >= admit_tier`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Quarantine,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quarantine => f.write_str("quarantine"),
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
        }
    }
}

impl std::str::FromStr for TrustTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quarantine" => Ok(Self::Quarantine),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(anyhow::anyhow!("unknown trust tier: {other}")),
        }
    }
}

/// Provenance classes ordered least to most trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by the model with no external grounding.
    ModelInferred,
    /// Scraped or fetched from the open web.
    Web,
    /// Reported by an installed, known plugin.
    KnownPlugin,
    /// Typed by the human operator.
    UserTyped,
}

/// One named contribution to a trust score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSignal {
    /// Signal identifier ("provenance", "corroboration", ...).
    pub id: String,
    /// This signal's value after weighting, in [0,1].
    pub contribution: f64,
}

/// A computed trust score. The tier is fixed at computation time and never
/// recomputed on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustScore {
    pub value: f64,
    pub tier: TrustTier,
    pub signals: Vec<TrustSignal>,
    pub computed_at: DateTime<Utc>,
}

/// Lifecycle state of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    Draft,
    Committed,
    Quarantined,
    Rejected,
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => f.write_str("draft"),
            Self::Committed => f.write_str("committed"),
            Self::Quarantined => f.write_str("quarantined"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// A fact held by the memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    /// Entry kind ("fact", "preference", "tool_result", ...). Duplicate
    /// detection is scoped to the kind.
    pub kind: String,
    pub content: String,
    /// Optional embedding vector supplied by an external service.
    pub embedding: Option<Vec<f32>>,
    /// Origin description (e.g. "planner", "plugin:weather").
    pub source: String,
    pub trust: TrustScore,
    pub state: MemoryState,
    pub created_at: DateTime<Utc>,
    /// Entry this one replaced, if admitted via supersede.
    pub supersedes: Option<Uuid>,
    /// Entry that replaced this one.
    pub superseded_by: Option<Uuid>,
}

/// A candidate fact offered to the memory gate for admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCandidate {
    pub kind: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    /// Origin description, matched against the configured trust list.
    pub source: String,
    pub provenance: Provenance,
    /// How many independent sources corroborate this fact.
    pub corroboration: u32,
    /// When the underlying observation was made.
    pub observed_at: DateTime<Utc>,
}

/// A tracked goal. Priority 1 is highest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub priority: u8,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A todo derived from (or attached to) a goal. Same shape as a goal plus
/// urgency and an optional parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub priority: u8,
    pub urgent: bool,
    pub parent_goal_id: Option<Uuid>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// What to do for this step when it fails after side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// Run the registered compensation.
    Attempt,
    /// Leave the effect in place.
    Skip,
}

/// One candidate step in a submitted plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_index: usize,
    pub tool_id: String,
    pub input: serde_json::Value,
    /// Planner-supplied rationale, surfaced to the operator on approval.
    pub justification: String,
    pub rollback_policy: RollbackPolicy,
}

/// Per-episode state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    Idle,
    Planning,
    AwaitingApproval,
    Executing,
    Verifying,
    Committing,
    Compensating,
    Done,
    Failed,
    SafeMode,
}

impl EpisodeState {
    /// Terminal from the kernel's point of view. `SafeMode` is
    /// terminal-for-episode but the kernel keeps serving read-only calls.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::SafeMode)
    }
}

impl std::fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Committing => "committing",
            Self::Compensating => "compensating",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::SafeMode => "safe_mode",
        };
        f.write_str(s)
    }
}

/// Event kinds recorded by the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "plan.emitted")]
    PlanEmitted,
    #[serde(rename = "call.requested")]
    CallRequested,
    #[serde(rename = "call.validated")]
    CallValidated,
    #[serde(rename = "call.approval_requested")]
    CallApprovalRequested,
    #[serde(rename = "call.approved")]
    CallApproved,
    #[serde(rename = "call.denied")]
    CallDenied,
    #[serde(rename = "call.started")]
    CallStarted,
    #[serde(rename = "call.succeeded")]
    CallSucceeded,
    #[serde(rename = "call.failed")]
    CallFailed,
    #[serde(rename = "postcond.failed")]
    PostcondFailed,
    #[serde(rename = "invariant.violated")]
    InvariantViolated,
    #[serde(rename = "memory.committed")]
    MemoryCommitted,
    #[serde(rename = "memory.quarantined")]
    MemoryQuarantined,
    #[serde(rename = "compensation.run")]
    CompensationRun,
    #[serde(rename = "drift.exceeded")]
    DriftExceeded,
    #[serde(rename = "episode.state")]
    EpisodeStateChanged,
    #[serde(rename = "safe_mode.entered")]
    SafeModeEntered,
    #[serde(rename = "safe_mode.exited")]
    SafeModeExited,
    #[serde(rename = "kernel.up")]
    KernelUp,
    #[serde(rename = "kernel.down")]
    KernelDown,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PlanEmitted => "plan.emitted",
            Self::CallRequested => "call.requested",
            Self::CallValidated => "call.validated",
            Self::CallApprovalRequested => "call.approval_requested",
            Self::CallApproved => "call.approved",
            Self::CallDenied => "call.denied",
            Self::CallStarted => "call.started",
            Self::CallSucceeded => "call.succeeded",
            Self::CallFailed => "call.failed",
            Self::PostcondFailed => "postcond.failed",
            Self::InvariantViolated => "invariant.violated",
            Self::MemoryCommitted => "memory.committed",
            Self::MemoryQuarantined => "memory.quarantined",
            Self::CompensationRun => "compensation.run",
            Self::DriftExceeded => "drift.exceeded",
            Self::EpisodeStateChanged => "episode.state",
            Self::SafeModeEntered => "safe_mode.entered",
            Self::SafeModeExited => "safe_mode.exited",
            Self::KernelUp => "kernel.up",
            Self::KernelDown => "kernel.down",
        };
        f.write_str(s)
    }
}

/// A single entry in the kernel's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing sequence number assigned on append.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub episode_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

/// The persona half of the identity descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    /// Short self-description.
    pub summary: String,
    /// Topics the persona is expected to stay within.
    pub allowed_topics: Vec<String>,
}

/// A constraint the agent must never violate. Violations fire the drift
/// monitor at critical severity regardless of the rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardConstraint {
    pub id: String,
    pub description: String,
    /// Case-insensitive terms whose presence in an output is a violation.
    pub forbidden_terms: Vec<String>,
}

/// Versioned identity descriptor the drift monitor compares outputs against.
///
/// `hash` is a deterministic SHA-256 digest over every field except `version`
/// and `hash` itself; any field change increments `version` and recomputes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDescriptor {
    pub version: u32,
    pub hash: String,
    pub persona: PersonaProfile,
    /// Style exemplar text; lexical drift is measured against it.
    pub communication_style: String,
    pub soft_preferences: Vec<String>,
    pub hard_constraints: Vec<HardConstraint>,
}

/// Partial update applied to the identity descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityPatch {
    pub persona: Option<PersonaProfile>,
    pub communication_style: Option<String>,
    pub soft_preferences: Option<Vec<String>>,
    pub hard_constraints: Option<Vec<HardConstraint>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_tier_ordering() {
        assert!(TrustTier::High > TrustTier::Medium);
        assert!(TrustTier::Medium > TrustTier::Low);
        assert!(TrustTier::Low > TrustTier::Quarantine);
    }

    #[test]
    fn test_trust_tier_from_str() {
        assert_eq!(
            "medium".parse::<TrustTier>().expect("ok"),
            TrustTier::Medium
        );
        assert_eq!("HIGH".parse::<TrustTier>().expect("ok"), TrustTier::High);
        assert!("bogus".parse::<TrustTier>().is_err());
    }

    #[test]
    fn test_trust_tier_roundtrip() {
        for tier in &[
            TrustTier::Quarantine,
            TrustTier::Low,
            TrustTier::Medium,
            TrustTier::High,
        ] {
            let s = tier.to_string();
            let parsed: TrustTier = s.parse().expect("roundtrip should work");
            assert_eq!(*tier, parsed);
        }
    }

    #[test]
    fn test_event_kind_serde_names() {
        let json = serde_json::to_string(&EventKind::CallApprovalRequested).expect("serialize");
        assert_eq!(json, r#""call.approval_requested""#);
        let back: EventKind = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, EventKind::CallApprovalRequested);
    }

    #[test]
    fn test_event_kind_display_matches_serde() {
        for kind in &[
            EventKind::PlanEmitted,
            EventKind::CallFailed,
            EventKind::MemoryQuarantined,
            EventKind::SafeModeEntered,
            EventKind::KernelDown,
        ] {
            let via_display = kind.to_string();
            let via_serde = serde_json::to_value(kind).expect("serialize");
            assert_eq!(via_serde, serde_json::Value::String(via_display));
        }
    }

    #[test]
    fn test_episode_state_terminality() {
        assert!(EpisodeState::Done.is_terminal());
        assert!(EpisodeState::Failed.is_terminal());
        assert!(EpisodeState::SafeMode.is_terminal());
        assert!(!EpisodeState::Verifying.is_terminal());
        assert!(!EpisodeState::Idle.is_terminal());
    }

    #[test]
    fn test_call_source_display() {
        assert_eq!(CallSource::Planner.to_string(), "planner");
        assert_eq!(
            CallSource::Subsystem("scheduler".to_owned()).to_string(),
            "subsystem:scheduler"
        );
    }
}
