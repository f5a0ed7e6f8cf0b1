//! Trust scoring for candidate facts and memories.
//!
//! Pure: a score is a function of the candidate and a caller-supplied clock
//! instant, so the same inputs always produce the same score. The tier is
//! fixed at computation time and never recomputed on read.
//!
//! Four signals feed the score: provenance class, corroboration count,
//! staleness of the observation, and the configured source trust list. Each
//! signal may pull the score down by at most its weight; the final value is
//! the minimum over the weighted signals, clamped to [0,1].

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::{TrustSection, TrustThresholds};
use crate::types::{MemoryCandidate, Provenance, TrustScore, TrustSignal};

/// How hard provenance can pull the score down.
const PROVENANCE_WEIGHT: f64 = 1.0;
/// How hard a lack of corroboration can pull the score down.
const CORROBORATION_WEIGHT: f64 = 0.4;
/// How hard staleness can pull the score down.
const STALENESS_WEIGHT: f64 = 0.5;
/// How hard an unlisted source can pull the score down.
const SOURCE_WEIGHT: f64 = 0.25;

/// Base contribution of a source that is not on the trust list.
const UNLISTED_SOURCE_CONTRIBUTION: f64 = 0.8;
/// Corroboration contribution floor (an uncorroborated fact is not worthless).
const CORROBORATION_FLOOR: f64 = 0.5;
/// Contribution added per corroborating source.
const CORROBORATION_STEP: f64 = 0.1;

/// Maps candidates to trust scores and tiers.
#[derive(Debug, Clone)]
pub struct TrustScorer {
    thresholds: TrustThresholds,
    trusted_sources: HashSet<String>,
    stale_horizon_ms: u64,
}

impl TrustScorer {
    /// Build a scorer from the trust config section.
    pub fn new(config: &TrustSection) -> Self {
        Self {
            thresholds: config.thresholds,
            trusted_sources: config.trusted_sources.iter().cloned().collect(),
            stale_horizon_ms: config.stale_horizon_ms.max(1),
        }
    }

    /// Score a candidate at the given instant.
    pub fn score(&self, candidate: &MemoryCandidate, now: DateTime<Utc>) -> TrustScore {
        let signals = vec![
            weighted(
                "provenance",
                PROVENANCE_WEIGHT,
                provenance_contribution(candidate.provenance),
            ),
            weighted(
                "corroboration",
                CORROBORATION_WEIGHT,
                corroboration_contribution(candidate.corroboration),
            ),
            weighted(
                "staleness",
                STALENESS_WEIGHT,
                self.freshness(candidate.observed_at, now),
            ),
            weighted(
                "source_trust",
                SOURCE_WEIGHT,
                if self.trusted_sources.contains(&candidate.source) {
                    1.0
                } else {
                    UNLISTED_SOURCE_CONTRIBUTION
                },
            ),
        ];

        let value = signals
            .iter()
            .map(|s| s.contribution)
            .fold(1.0_f64, f64::min)
            .clamp(0.0, 1.0);

        TrustScore {
            value,
            tier: self.thresholds.tier_for(value),
            signals,
            computed_at: now,
        }
    }

    /// Linear freshness decay: 1.0 for a fresh observation, 0.0 at or past
    /// the stale horizon. A future-dated observation counts as fresh.
    #[allow(clippy::cast_precision_loss)] // ages and horizons stay far below 2^52 ms
    fn freshness(&self, observed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_ms = now
            .signed_duration_since(observed_at)
            .num_milliseconds()
            .max(0);
        let age = u64::try_from(age_ms).unwrap_or(0);
        let horizon = self.stale_horizon_ms;
        if age >= horizon {
            return 0.0;
        }
        // Both fit f64's integer range for any realistic horizon.
        let ratio = (age as f64) / (horizon as f64);
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    /// Tier thresholds this scorer derives tiers from.
    pub fn thresholds(&self) -> TrustThresholds {
        self.thresholds
    }
}

/// Apply a weight to a raw contribution: a signal can pull the score down by
/// at most its weight.
fn weighted(id: &str, weight: f64, contribution: f64) -> TrustSignal {
    TrustSignal {
        id: id.to_owned(),
        contribution: (1.0 - weight * (1.0 - contribution)).clamp(0.0, 1.0),
    }
}

/// Raw provenance contribution, ordered by source reliability.
fn provenance_contribution(provenance: Provenance) -> f64 {
    match provenance {
        Provenance::UserTyped => 1.0,
        Provenance::KnownPlugin => 0.85,
        Provenance::Web => 0.6,
        Provenance::ModelInferred => 0.3,
    }
}

/// Corroboration contribution grows with the count and saturates at 1.0.
fn corroboration_contribution(count: u32) -> f64 {
    let count = f64::from(count.min(16));
    (CORROBORATION_FLOOR + CORROBORATION_STEP * count).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrustTier;

    fn candidate(provenance: Provenance) -> MemoryCandidate {
        MemoryCandidate {
            kind: "fact".to_owned(),
            content: "the meeting is at noon".to_owned(),
            embedding: None,
            source: "planner".to_owned(),
            provenance,
            corroboration: 0,
            observed_at: Utc::now(),
        }
    }

    fn scorer() -> TrustScorer {
        TrustScorer::new(&TrustSection::default())
    }

    // ── Provenance ordering ──

    #[test]
    fn test_user_typed_scores_high() {
        let score = scorer().score(&candidate(Provenance::UserTyped), Utc::now());
        assert_eq!(score.tier, TrustTier::High, "value was {}", score.value);
    }

    #[test]
    fn test_model_inferred_scores_below_admit() {
        let score = scorer().score(&candidate(Provenance::ModelInferred), Utc::now());
        assert_eq!(score.tier, TrustTier::Low, "value was {}", score.value);
        assert!(score.value < 0.5);
    }

    #[test]
    fn test_provenance_is_monotone() {
        let now = Utc::now();
        let s = scorer();
        let user = s.score(&candidate(Provenance::UserTyped), now).value;
        let plugin = s.score(&candidate(Provenance::KnownPlugin), now).value;
        let web = s.score(&candidate(Provenance::Web), now).value;
        let model = s.score(&candidate(Provenance::ModelInferred), now).value;
        assert!(user >= plugin);
        assert!(plugin >= web);
        assert!(web > model);
    }

    // ── Corroboration ──

    #[test]
    fn test_corroboration_raises_score() {
        let now = Utc::now();
        let s = scorer();
        let mut uncorroborated = candidate(Provenance::UserTyped);
        uncorroborated.corroboration = 0;
        let mut corroborated = candidate(Provenance::UserTyped);
        corroborated.corroboration = 5;

        let low = s.score(&uncorroborated, now).value;
        let high = s.score(&corroborated, now).value;
        assert!(high > low, "corroboration should raise the score");
    }

    // ── Staleness ──

    #[test]
    fn test_stale_observation_degrades_score() {
        let now = Utc::now();
        let s = scorer();
        let fresh = candidate(Provenance::UserTyped);
        let mut stale = candidate(Provenance::UserTyped);
        stale.observed_at = now
            .checked_sub_signed(chrono::TimeDelta::days(365))
            .expect("test: 365d subtraction should not overflow");

        let fresh_value = s.score(&fresh, now).value;
        let stale_value = s.score(&stale, now).value;
        assert!(stale_value < fresh_value);
        // A fully stale observation bottoms out at 1 - STALENESS_WEIGHT.
        assert!((stale_value - 0.5).abs() < 1e-9, "got {stale_value}");
    }

    #[test]
    fn test_future_observation_counts_as_fresh() {
        let now = Utc::now();
        let s = scorer();
        let mut future = candidate(Provenance::UserTyped);
        future.observed_at = now
            .checked_add_signed(chrono::TimeDelta::seconds(30))
            .expect("test: 30s addition should not overflow");
        let score = s.score(&future, now);
        assert_eq!(score.tier, TrustTier::High);
    }

    // ── Source trust list ──

    #[test]
    fn test_trusted_source_beats_unlisted() {
        let mut section = TrustSection::default();
        section.trusted_sources = vec!["subsystem:scheduler".to_owned()];
        let s = TrustScorer::new(&section);
        let now = Utc::now();

        let mut listed = candidate(Provenance::Web);
        listed.source = "subsystem:scheduler".to_owned();
        let unlisted = candidate(Provenance::Web);

        let listed_value = s.score(&listed, now).value;
        let unlisted_value = s.score(&unlisted, now).value;
        assert!(listed_value >= unlisted_value);
    }

    // ── Purity and bookkeeping ──

    #[test]
    fn test_score_is_deterministic() {
        let now = Utc::now();
        let s = scorer();
        let c = candidate(Provenance::Web);
        let a = s.score(&c, now);
        let b = s.score(&c, now);
        assert_eq!(a.value, b.value);
        assert_eq!(a.tier, b.tier);
        assert_eq!(a.computed_at, b.computed_at);
    }

    #[test]
    fn test_all_signals_recorded() {
        let score = scorer().score(&candidate(Provenance::UserTyped), Utc::now());
        let ids: Vec<&str> = score.signals.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["provenance", "corroboration", "staleness", "source_trust"]
        );
        for signal in &score.signals {
            assert!((0.0..=1.0).contains(&signal.contribution));
        }
    }

    #[test]
    fn test_value_always_clamped() {
        let now = Utc::now();
        let s = scorer();
        for provenance in [
            Provenance::UserTyped,
            Provenance::KnownPlugin,
            Provenance::Web,
            Provenance::ModelInferred,
        ] {
            let mut c = candidate(provenance);
            c.corroboration = 100;
            let score = s.score(&c, now);
            assert!((0.0..=1.0).contains(&score.value));
        }
    }
}
