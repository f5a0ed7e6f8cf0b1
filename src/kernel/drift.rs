//! Drift monitor — detects persona/identity drift in agent outputs.
//!
//! Holds the versioned identity descriptor and scores every agent-authored
//! output over three channels: lexical similarity to the style exemplar,
//! hard-constraint violations, and topic divergence from the persona's
//! allowed topics. Soft drift fires `drift.exceeded` when the rolling window
//! average crosses the soft threshold; a hard-constraint violation fires
//! immediately at critical severity regardless of the window.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DriftSection;
use crate::kernel::event_store::EventStore;
use crate::kernel::journal::Journal;
use crate::types::{EventKind, IdentityDescriptor, IdentityPatch};

/// Channel weights. Lexical drift dominates because it is the cheapest
/// signal to fake the other way.
const LEXICAL_WEIGHT: f64 = 0.45;
const TOPIC_WEIGHT: f64 = 0.35;
const CONSTRAINT_WEIGHT: f64 = 0.2;

/// Verdict for one observed output.
#[derive(Debug, Clone)]
pub struct DriftVerdict {
    /// Drift score for this output, in [0,1].
    pub score: f64,
    /// Rolling window average after this observation.
    pub window_average: f64,
    /// IDs of hard constraints this output violated.
    pub hard_violations: Vec<String>,
    /// Window average crossed the soft threshold.
    pub exceeded: bool,
    /// Hard violation, or window average past the hard threshold.
    pub critical: bool,
}

/// Monitors agent outputs against the current identity descriptor.
pub struct DriftMonitor {
    identity: Mutex<IdentityDescriptor>,
    window: Mutex<VecDeque<f64>>,
    config: DriftSection,
    events: Arc<EventStore>,
    journal: Option<Arc<Journal>>,
}

impl std::fmt::Debug for DriftMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftMonitor")
            .field("config", &self.config)
            .finish()
    }
}

impl DriftMonitor {
    /// Create a monitor around an initial descriptor. The descriptor's
    /// version is forced to 1 and its hash recomputed.
    pub fn new(mut initial: IdentityDescriptor, config: DriftSection, events: Arc<EventStore>) -> Self {
        initial.version = 1;
        initial.hash = descriptor_hash(&initial);
        Self {
            identity: Mutex::new(initial),
            window: Mutex::new(VecDeque::new()),
            config,
            events,
            journal: None,
        }
    }

    /// Attach the journal so identity versions persist.
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Resume from a journaled descriptor, keeping its version and hash.
    pub fn resume(
        descriptor: IdentityDescriptor,
        config: DriftSection,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            identity: Mutex::new(descriptor),
            window: Mutex::new(VecDeque::new()),
            config,
            events,
            journal: None,
        }
    }

    /// Current identity descriptor.
    pub fn identity(&self) -> IdentityDescriptor {
        self.lock_identity().clone()
    }

    /// Apply a patch: bump version, recompute hash, journal the new version.
    pub fn update_identity(&self, patch: IdentityPatch) -> IdentityDescriptor {
        let mut identity = self.lock_identity();
        if let Some(persona) = patch.persona {
            identity.persona = persona;
        }
        if let Some(style) = patch.communication_style {
            identity.communication_style = style;
        }
        if let Some(prefs) = patch.soft_preferences {
            identity.soft_preferences = prefs;
        }
        if let Some(constraints) = patch.hard_constraints {
            identity.hard_constraints = constraints;
        }
        identity.version = identity.version.saturating_add(1);
        identity.hash = descriptor_hash(&identity);

        let snapshot = identity.clone();
        drop(identity);

        info!(version = snapshot.version, hash = %snapshot.hash, "identity updated");
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.insert_identity_version(&snapshot) {
                warn!(error = %e, "failed to journal identity version");
            }
        }
        snapshot
    }

    /// Score one agent-authored output and update the rolling window.
    pub fn observe(&self, output: &str, episode_id: Option<Uuid>) -> DriftVerdict {
        let identity = self.lock_identity().clone();

        let hard_violations: Vec<String> = identity
            .hard_constraints
            .iter()
            .filter(|c| violates(c, output))
            .map(|c| c.id.clone())
            .collect();

        let lexical_drift = 1.0 - jaccard(output, &identity.communication_style);
        let topic_divergence = topic_divergence(output, &identity.persona.allowed_topics);
        let constraint_channel = if identity.hard_constraints.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)] // constraint counts are tiny
            let fraction =
                (hard_violations.len() as f64) / (identity.hard_constraints.len() as f64);
            fraction.clamp(0.0, 1.0)
        };

        let score = (LEXICAL_WEIGHT * lexical_drift
            + TOPIC_WEIGHT * topic_divergence
            + CONSTRAINT_WEIGHT * constraint_channel)
            .clamp(0.0, 1.0);

        let window_average = {
            let mut window = match self.window.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            window.push_back(score);
            while window.len() > self.config.window_size.max(1) {
                window.pop_front();
            }
            average(&window)
        };

        let critical = !hard_violations.is_empty() || window_average > self.config.hard_threshold;
        let exceeded = window_average > self.config.soft_threshold;

        if critical {
            warn!(
                violations = ?hard_violations,
                window_average,
                "critical persona drift detected"
            );
            self.events.append(
                EventKind::DriftExceeded,
                episode_id,
                serde_json::json!({
                    "severity": "critical",
                    "score": score,
                    "window_average": window_average,
                    "violated_constraints": hard_violations,
                }),
            );
        } else if exceeded {
            self.events.append(
                EventKind::DriftExceeded,
                episode_id,
                serde_json::json!({
                    "severity": "soft",
                    "score": score,
                    "window_average": window_average,
                }),
            );
        }

        DriftVerdict {
            score,
            window_average,
            hard_violations,
            exceeded,
            critical,
        }
    }

    /// Check an output against hard constraints only, without feeding the
    /// lexical window.
    ///
    /// The rolling window is for agent-authored prose; tool outputs are
    /// structured data, but a hard constraint (leaked secret, forbidden
    /// content) is a violation no matter where the text appears. Emits a
    /// critical `drift.exceeded` when anything matches.
    pub fn scan_constraints(&self, output: &str, episode_id: Option<Uuid>) -> Vec<String> {
        let identity = self.lock_identity().clone();
        let violations: Vec<String> = identity
            .hard_constraints
            .iter()
            .filter(|c| violates(c, output))
            .map(|c| c.id.clone())
            .collect();

        if !violations.is_empty() {
            warn!(violations = ?violations, "hard constraint violated in output");
            self.events.append(
                EventKind::DriftExceeded,
                episode_id,
                serde_json::json!({
                    "severity": "critical",
                    "violated_constraints": violations,
                }),
            );
        }
        violations
    }

    /// Current rolling window average (0.0 when nothing observed yet).
    pub fn window_average(&self) -> f64 {
        let window = match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        average(&window)
    }

    /// Hard drift cutoff, for the invariant checker.
    pub fn hard_threshold(&self) -> f64 {
        self.config.hard_threshold
    }

    fn lock_identity(&self) -> std::sync::MutexGuard<'_, IdentityDescriptor> {
        match self.identity.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Deterministic digest over everything except `version` and `hash`.
fn descriptor_hash(identity: &IdentityDescriptor) -> String {
    let mut hasher = Sha256::new();
    let core = serde_json::json!({
        "persona": identity.persona,
        "communication_style": identity.communication_style,
        "soft_preferences": identity.soft_preferences,
        "hard_constraints": identity.hard_constraints,
    });
    hasher.update(core.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Case-insensitive check of a constraint's forbidden terms.
fn violates(constraint: &crate::types::HardConstraint, output: &str) -> bool {
    let lowered = output.to_lowercase();
    constraint
        .forbidden_terms
        .iter()
        .any(|term| !term.is_empty() && lowered.contains(&term.to_lowercase()))
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(str::to_owned)
        .collect()
}

/// Jaccard similarity between two token sets.
#[allow(clippy::cast_precision_loss)] // token counts are tiny
fn jaccard(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    (intersection as f64) / (union as f64)
}

/// Fraction of output tokens outside the allowed-topic vocabulary.
#[allow(clippy::cast_precision_loss)] // token counts are tiny
fn topic_divergence(output: &str, allowed_topics: &[String]) -> f64 {
    let output_tokens = tokens(output);
    if output_tokens.is_empty() || allowed_topics.is_empty() {
        return 0.0;
    }
    let vocab: HashSet<String> = allowed_topics.iter().flat_map(|t| tokens(t)).collect();
    let on_topic = output_tokens.iter().filter(|t| vocab.contains(*t)).count();
    let divergence = 1.0 - (on_topic as f64) / (output_tokens.len() as f64);
    divergence.clamp(0.0, 1.0)
}

fn average(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)] // window sizes are tiny
    let len = window.len() as f64;
    window.iter().sum::<f64>() / len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventStoreSection;
    use crate::kernel::event_store::EventQuery;
    use crate::types::{HardConstraint, PersonaProfile};

    fn base_identity() -> IdentityDescriptor {
        IdentityDescriptor {
            version: 0,
            hash: String::new(),
            persona: PersonaProfile {
                summary: "A careful personal assistant".to_owned(),
                allowed_topics: vec![
                    "scheduling calendar meetings email".to_owned(),
                    "notes tasks reminders".to_owned(),
                ],
            },
            communication_style: "Concise, friendly scheduling help for calendar and email tasks"
                .to_owned(),
            soft_preferences: vec!["prefer short answers".to_owned()],
            hard_constraints: vec![HardConstraint {
                id: "no-private-keys".to_owned(),
                description: "never reveal private keys".to_owned(),
                forbidden_terms: vec!["private key".to_owned(), "-----BEGIN".to_owned()],
            }],
        }
    }

    fn monitor(config: DriftSection) -> (DriftMonitor, Arc<EventStore>) {
        let events = Arc::new(EventStore::new(EventStoreSection::default()));
        (
            DriftMonitor::new(base_identity(), config, events.clone()),
            events,
        )
    }

    // ── Identity versioning ──

    #[test]
    fn test_initial_identity_is_version_one_with_hash() {
        let (monitor, _events) = monitor(DriftSection::default());
        let identity = monitor.identity();
        assert_eq!(identity.version, 1);
        assert_eq!(identity.hash.len(), 64, "hex sha256");
    }

    #[test]
    fn test_update_increments_version_and_changes_hash() {
        let (monitor, _events) = monitor(DriftSection::default());
        let before = monitor.identity();

        let after = monitor.update_identity(IdentityPatch {
            communication_style: Some("Terse, technical answers".to_owned()),
            ..IdentityPatch::default()
        });

        assert_eq!(after.version, before.version.saturating_add(1));
        assert_ne!(after.hash, before.hash);
        assert_eq!(monitor.identity().version, after.version);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = descriptor_hash(&base_identity());
        let b = descriptor_hash(&base_identity());
        assert_eq!(a, b);
    }

    // ── Hard constraints ──

    #[test]
    fn test_hard_violation_is_critical_immediately() {
        let (monitor, events) = monitor(DriftSection {
            window_size: 100,
            soft_threshold: 0.99,
            hard_threshold: 1.0,
        });

        let verdict = monitor.observe(
            "Sure! Here is the private key you asked for: -----BEGIN RSA",
            None,
        );
        assert!(verdict.critical, "hard violation must be critical");
        assert_eq!(verdict.hard_violations, vec!["no-private-keys"]);

        let fired = events.query(&EventQuery {
            kinds: Some(vec![EventKind::DriftExceeded]),
            ..EventQuery::default()
        });
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].payload["severity"], "critical");
    }

    #[test]
    fn test_constraint_match_is_case_insensitive() {
        let (monitor, _events) = monitor(DriftSection::default());
        let verdict = monitor.observe("your PRIVATE KEY is abc123", None);
        assert!(verdict.critical);
    }

    // ── Rolling window ──

    #[test]
    fn test_on_style_output_does_not_fire() {
        let (monitor, events) = monitor(DriftSection::default());
        let verdict = monitor.observe(
            "Concise friendly scheduling help: your calendar meetings and email tasks are synced",
            None,
        );
        assert!(!verdict.critical);
        assert!(!verdict.exceeded, "average was {}", verdict.window_average);
        assert!(events.is_empty());
    }

    #[test]
    fn test_sustained_off_style_output_fires_soft() {
        let (monitor, events) = monitor(DriftSection {
            window_size: 3,
            soft_threshold: 0.5,
            hard_threshold: 0.99,
        });

        let mut exceeded = false;
        for _ in 0..3 {
            let verdict = monitor.observe(
                "zorp blark quux flimflam jabberwock vorpal snicker snack",
                None,
            );
            exceeded = verdict.exceeded;
        }
        assert!(exceeded, "gibberish should exceed the soft threshold");

        let fired = events.query(&EventQuery {
            kinds: Some(vec![EventKind::DriftExceeded]),
            ..EventQuery::default()
        });
        assert!(!fired.is_empty());
        assert_eq!(fired[0].payload["severity"], "soft");
    }

    #[test]
    fn test_window_is_bounded() {
        let (monitor, _events) = monitor(DriftSection {
            window_size: 2,
            soft_threshold: 0.99,
            hard_threshold: 1.0,
        });

        // Two wildly off-style outputs, then several on-style ones: the
        // window must forget the old scores.
        monitor.observe("zorp blark quux", None);
        monitor.observe("flimflam jabberwock vorpal", None);
        let off_average = monitor.window_average();

        for _ in 0..4 {
            monitor.observe(
                "Concise friendly scheduling help for calendar and email tasks",
                None,
            );
        }
        assert!(monitor.window_average() < off_average);
    }

    // ── Channel math ──

    #[test]
    fn test_jaccard_identical_and_disjoint() {
        assert!((jaccard("calendar email", "calendar email") - 1.0).abs() < 1e-9);
        assert!(jaccard("calendar email", "zorp blark") < 1e-9);
    }

    #[test]
    fn test_topic_divergence_bounds() {
        let topics = vec!["calendar email".to_owned()];
        assert!(topic_divergence("calendar email", &topics) < 1e-9);
        assert!((topic_divergence("zorp blark", &topics) - 1.0).abs() < 1e-9);
        assert!(topic_divergence("anything", &[]) < 1e-9);
    }
}
