//! Kernel configuration loading and validation.
//!
//! One TOML file (`straylight.toml`) owns every tunable. All fields carry
//! serde defaults so a missing section falls back to a working kernel;
//! validation rejects configurations that would make the safety mechanisms
//! incoherent (non-monotone trust thresholds, unbounded event store).

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::types::TrustTier;

/// Configuration errors. Fatal at startup (launcher exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("cannot read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },
    /// TOML parse failure.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Trust thresholds are not strictly decreasing.
    #[error(
        "trust thresholds must be strictly decreasing: high={high} medium={medium} low={low} quarantine={quarantine}"
    )]
    BadThresholds {
        high: f64,
        medium: f64,
        low: f64,
        quarantine: f64,
    },
    /// A threshold is outside [0,1].
    #[error("trust threshold '{name}' out of range [0,1]: {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },
    /// Neither max_events nor retention_ms is set.
    #[error("event store must be bounded: set event_store.max_events or event_store.retention_ms")]
    UnboundedEventStore,
    /// Drift thresholds inverted.
    #[error("drift soft_threshold ({soft}) must not exceed hard_threshold ({hard})")]
    BadDriftThresholds { soft: f64, hard: f64 },
    /// Zero-size drift window.
    #[error("drift_monitor.window_size must be at least 1")]
    EmptyDriftWindow,
    /// Zero concurrent pipelines.
    #[error("workflow.max_concurrent must be at least 1")]
    NoConcurrency,
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    /// Agent presentation settings.
    #[serde(default)]
    pub agent: AgentSection,

    /// Trust tier thresholds.
    #[serde(default)]
    pub trust: TrustSection,

    /// Memory admission policy.
    #[serde(default)]
    pub memory: MemorySection,

    /// Persona drift monitoring.
    #[serde(default)]
    pub drift_monitor: DriftSection,

    /// Tool-check timeouts.
    #[serde(default)]
    pub tools: ToolsSection,

    /// Approval gate behavior.
    #[serde(default)]
    pub approval: ApprovalSection,

    /// Pipeline concurrency and deadlines.
    #[serde(default)]
    pub workflow: WorkflowSection,

    /// Event store bounds.
    #[serde(default)]
    pub event_store: EventStoreSection,

    /// Invariant checker switch.
    #[serde(default)]
    pub invariants: InvariantsSection,

    /// SQLite journal location.
    #[serde(default)]
    pub journal: JournalSection,

    /// Directory for rotated JSON logs.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
}

/// Agent presentation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// Display name reported by `status`.
    #[serde(default = "default_agent_name")]
    pub name: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
        }
    }
}

/// Trust tier cutoffs. Must be strictly decreasing.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrustThresholds {
    #[serde(default = "default_high")]
    pub high: f64,
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_low")]
    pub low: f64,
    /// Floor for the invariant checker: no committed entry may score below
    /// this. Sits under `low` in the monotone chain.
    #[serde(default = "default_quarantine")]
    pub quarantine: f64,
}

impl Default for TrustThresholds {
    fn default() -> Self {
        Self {
            high: default_high(),
            medium: default_medium(),
            low: default_low(),
            quarantine: default_quarantine(),
        }
    }
}

impl TrustThresholds {
    /// Map a clamped score value to its tier.
    pub fn tier_for(&self, value: f64) -> TrustTier {
        if value >= self.high {
            TrustTier::High
        } else if value >= self.medium {
            TrustTier::Medium
        } else if value >= self.low {
            TrustTier::Low
        } else {
            TrustTier::Quarantine
        }
    }
}

/// Trust scoring configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TrustSection {
    #[serde(default)]
    pub thresholds: TrustThresholds,

    /// Sources treated as fully trusted by the scorer.
    #[serde(default)]
    pub trusted_sources: Vec<String>,

    /// Age in milliseconds after which an observation scores zero freshness.
    #[serde(default = "default_stale_horizon_ms")]
    pub stale_horizon_ms: u64,
}

/// Memory admission policy.
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// Minimum tier a candidate needs to be committed.
    #[serde(default = "default_admit_tier")]
    pub admit_tier: TrustTier,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            admit_tier: default_admit_tier(),
        }
    }
}

/// Drift monitor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DriftSection {
    /// Rolling-window size for drift averaging.
    #[serde(default = "default_drift_window")]
    pub window_size: usize,

    /// Window average above this fires `drift.exceeded`.
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f64,

    /// Window average above this is critical and trips safe mode.
    #[serde(default = "default_hard_threshold")]
    pub hard_threshold: f64,
}

impl Default for DriftSection {
    fn default() -> Self {
        Self {
            window_size: default_drift_window(),
            soft_threshold: default_soft_threshold(),
            hard_threshold: default_hard_threshold(),
        }
    }
}

/// Tool-adjacent check timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// Timeout for any single post-condition or invariant check.
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

/// Approval gate behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalSection {
    /// Default wait before a pending request auto-denies with `timeout`.
    #[serde(default = "default_approval_timeout_ms")]
    pub timeout_ms: u64,

    /// Enables the `auto-if-read-only` shortcut.
    #[serde(default = "default_true")]
    pub auto_approve_read_only: bool,

    /// Sources whitelisted for the `source-trusted` policy.
    #[serde(default)]
    pub auto_approve_sources: Vec<String>,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_approval_timeout_ms(),
            auto_approve_read_only: default_true(),
            auto_approve_sources: Vec::new(),
        }
    }
}

/// Pipeline concurrency and deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    /// Max concurrent execution pipelines.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Tool deadline applied when a contract sets none.
    #[serde(default = "default_tool_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

/// Event store bounds. At least one of the two must be set.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EventStoreSection {
    /// Maximum retained events; oldest evicted beyond this.
    #[serde(default = "default_max_events")]
    pub max_events: Option<usize>,

    /// Events older than this are evicted on append.
    #[serde(default)]
    pub retention_ms: Option<u64>,
}

impl Default for EventStoreSection {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            retention_ms: None,
        }
    }
}

/// Invariant checker switch.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct InvariantsSection {
    /// Toggles checkpoint invariant evaluation (default on).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for InvariantsSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

/// SQLite journal location.
#[derive(Debug, Clone, Deserialize)]
pub struct JournalSection {
    /// Path to the journal database; `:memory:` for an ephemeral kernel.
    #[serde(default = "default_journal_path")]
    pub path: String,
}

impl Default for JournalSection {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
        }
    }
}

fn default_agent_name() -> String {
    "straylight".to_owned()
}

fn default_high() -> f64 {
    0.75
}

fn default_medium() -> f64 {
    0.5
}

fn default_low() -> f64 {
    0.25
}

fn default_quarantine() -> f64 {
    0.1
}

fn default_stale_horizon_ms() -> u64 {
    // 30 days.
    2_592_000_000
}

fn default_admit_tier() -> TrustTier {
    TrustTier::Medium
}

fn default_drift_window() -> usize {
    20
}

fn default_soft_threshold() -> f64 {
    0.55
}

fn default_hard_threshold() -> f64 {
    0.8
}

fn default_check_timeout_ms() -> u64 {
    2_000
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    1
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

fn default_max_events() -> Option<usize> {
    Some(10_000)
}

fn default_journal_path() -> String {
    ":memory:".to_owned()
}

fn default_logs_dir() -> String {
    "logs".to_owned()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            agent: AgentSection::default(),
            trust: TrustSection::default(),
            memory: MemorySection::default(),
            drift_monitor: DriftSection::default(),
            tools: ToolsSection::default(),
            approval: ApprovalSection::default(),
            workflow: WorkflowSection::default(),
            event_store: EventStoreSection::default(),
            invariants: InvariantsSection::default(),
            journal: JournalSection::default(),
            logs_dir: default_logs_dir(),
        }
    }
}

impl KernelConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Unreadable {
                path: path.as_ref().display().to_string(),
                reason: e.to_string(),
            })?;
        Self::parse(&raw)
    }

    /// Parse and validate a TOML string.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.trust.thresholds;
        for (name, value) in [
            ("high", t.high),
            ("medium", t.medium),
            ("low", t.low),
            ("quarantine", t.quarantine),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        if !(t.high > t.medium && t.medium > t.low && t.low > t.quarantine) {
            return Err(ConfigError::BadThresholds {
                high: t.high,
                medium: t.medium,
                low: t.low,
                quarantine: t.quarantine,
            });
        }

        if self.event_store.max_events.is_none() && self.event_store.retention_ms.is_none() {
            return Err(ConfigError::UnboundedEventStore);
        }

        if self.drift_monitor.soft_threshold > self.drift_monitor.hard_threshold {
            return Err(ConfigError::BadDriftThresholds {
                soft: self.drift_monitor.soft_threshold,
                hard: self.drift_monitor.hard_threshold,
            });
        }
        if self.drift_monitor.window_size == 0 {
            return Err(ConfigError::EmptyDriftWindow);
        }

        if self.workflow.max_concurrent == 0 {
            return Err(ConfigError::NoConcurrency);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = KernelConfig::parse("").expect("empty config should parse");
        assert_eq!(config.agent.name, "straylight");
        assert_eq!(config.memory.admit_tier, TrustTier::Medium);
        assert_eq!(config.workflow.max_concurrent, 1);
        assert_eq!(config.event_store.max_events, Some(10_000));
        assert!(config.invariants.enabled);
        assert!(config.approval.auto_approve_read_only);
    }

    #[test]
    fn test_tier_boundaries() {
        let t = TrustThresholds::default();
        assert_eq!(t.tier_for(0.9), TrustTier::High);
        assert_eq!(t.tier_for(0.75), TrustTier::High);
        assert_eq!(t.tier_for(0.6), TrustTier::Medium);
        assert_eq!(t.tier_for(0.5), TrustTier::Medium);
        assert_eq!(t.tier_for(0.3), TrustTier::Low);
        assert_eq!(t.tier_for(0.25), TrustTier::Low);
        assert_eq!(t.tier_for(0.1), TrustTier::Quarantine);
        assert_eq!(t.tier_for(0.0), TrustTier::Quarantine);
    }

    #[test]
    fn test_non_monotone_thresholds_rejected() {
        let raw = r#"
[trust.thresholds]
high = 0.5
medium = 0.5
low = 0.25
quarantine = 0.1
"#;
        let err = KernelConfig::parse(raw).expect_err("equal thresholds must fail");
        assert!(matches!(err, ConfigError::BadThresholds { .. }));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let raw = r#"
[trust.thresholds]
high = 1.5
medium = 0.5
low = 0.25
quarantine = 0.1
"#;
        let err = KernelConfig::parse(raw).expect_err("out-of-range threshold must fail");
        assert!(matches!(
            err,
            ConfigError::ThresholdOutOfRange { name: "high", .. }
        ));
    }

    #[test]
    fn test_unbounded_event_store_rejected() {
        let raw = r#"
[event_store]
max_events = 0
"#;
        // TOML cannot express Option::None for a defaulted Some; use an
        // explicit parse of a config struct instead.
        let mut config = KernelConfig::parse(raw).expect("parses");
        config.event_store.max_events = None;
        config.event_store.retention_ms = None;
        let err = config.validate().expect_err("unbounded store must fail");
        assert!(matches!(err, ConfigError::UnboundedEventStore));
    }

    #[test]
    fn test_retention_only_is_valid() {
        let mut config = KernelConfig::default();
        config.event_store.max_events = None;
        config.event_store.retention_ms = Some(60_000);
        config.validate().expect("retention-only bound is valid");
    }

    #[test]
    fn test_inverted_drift_thresholds_rejected() {
        let raw = r#"
[drift_monitor]
soft_threshold = 0.9
hard_threshold = 0.5
"#;
        let err = KernelConfig::parse(raw).expect_err("inverted drift thresholds must fail");
        assert!(matches!(err, ConfigError::BadDriftThresholds { .. }));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let raw = r#"
[workflow]
max_concurrent = 0
"#;
        let err = KernelConfig::parse(raw).expect_err("zero concurrency must fail");
        assert!(matches!(err, ConfigError::NoConcurrency));
    }

    #[test]
    fn test_full_config_roundtrip() {
        let raw = r#"
logs_dir = "/tmp/straylight-logs"

[agent]
name = "tessier"

[trust]
trusted_sources = ["user", "subsystem:scheduler"]

[trust.thresholds]
high = 0.8
medium = 0.6
low = 0.3
quarantine = 0.15

[memory]
admit_tier = "high"

[drift_monitor]
window_size = 5
soft_threshold = 0.4
hard_threshold = 0.7

[approval]
timeout_ms = 50
auto_approve_read_only = false
auto_approve_sources = ["subsystem:heartbeat"]

[workflow]
max_concurrent = 2
default_timeout_ms = 1000

[event_store]
max_events = 64

[invariants]
enabled = false

[journal]
path = ":memory:"
"#;
        let config = KernelConfig::parse(raw).expect("full config should parse");
        assert_eq!(config.agent.name, "tessier");
        assert_eq!(config.memory.admit_tier, TrustTier::High);
        assert_eq!(config.drift_monitor.window_size, 5);
        assert_eq!(config.approval.timeout_ms, 50);
        assert!(!config.approval.auto_approve_read_only);
        assert_eq!(config.workflow.max_concurrent, 2);
        assert_eq!(config.event_store.max_events, Some(64));
        assert!(!config.invariants.enabled);
        assert_eq!(config.logs_dir, "/tmp/straylight-logs");
    }
}
