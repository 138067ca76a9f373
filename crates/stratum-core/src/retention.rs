//! Retention weight decay and sweep classification.
//!
//! Each entry carries a decaying retention weight:
//! `weight(t) = initial * exp(-rate * dt_hours)` where
//! `rate = base / (1 + importance + ln(1 + access_count))`: higher
//! importance and more access slow decay. Rewards refresh the initial
//! weight and re-anchor the decay clock.
//!
//! The gate only *classifies*; placement changes are executed by the
//! stratum store so each move stays atomic per entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::domain::{EntryId, MemoryEntry, RetentionState, Stratum};

/// Damped decay rate per hour for an entry's importance/access profile.
pub fn decay_rate(base: f64, importance: u8, access_count: u64) -> f64 {
    base / (1.0 + f64::from(importance) + (1.0 + access_count as f64).ln())
}

/// Sweep decision for a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Weight above the promotion threshold; move one level toward Semantic.
    Promote,
    /// Weight below the floor; move one level toward Working.
    Demote,
    /// TTL elapsed, or below the floor while already at Working.
    Delete,
    Keep,
}

/// Result of one sweep pass, in the order actions were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// (source id, replacement id) pairs.
    pub promoted: Vec<(EntryId, EntryId)>,
    /// (source id, replacement id) pairs.
    pub demoted: Vec<(EntryId, EntryId)>,
    pub expired: Vec<EntryId>,
}

impl SweepOutcome {
    pub fn is_noop(&self) -> bool {
        self.promoted.is_empty() && self.demoted.is_empty() && self.expired.is_empty()
    }
}

/// Decay computation and sweep classification policy.
#[derive(Debug, Clone)]
pub struct RetentionGate {
    base_rate: f64,
    promotion_threshold: f64,
    demotion_floor: f64,
    initial_weight: f64,
}

impl RetentionGate {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_rate: config.decay_base_rate,
            promotion_threshold: config.promotion_threshold,
            demotion_floor: config.demotion_floor,
            initial_weight: config.initial_retention_weight,
        }
    }

    /// The weight a fresh or re-anchored entry starts from.
    pub fn initial_weight(&self) -> f64 {
        self.initial_weight
    }

    /// Current decayed weight of an entry.
    pub fn compute_weight(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
        let dt_hours = (now - entry.retention.anchored_at)
            .num_milliseconds()
            .max(0) as f64
            / 3_600_000.0;
        let rate = decay_rate(self.base_rate, entry.importance, entry.access_count);
        entry.retention.initial_weight * (-rate * dt_hours).exp()
    }

    /// Apply a reward multiplier: refresh the initial weight (capped at 1)
    /// and re-anchor the decay clock to `now`.
    pub fn apply_reward(&self, entry: &mut MemoryEntry, multiplier: f64, now: DateTime<Utc>) {
        let refreshed = (entry.retention.initial_weight * multiplier).min(1.0);
        entry.retention = RetentionState::anchored(refreshed, now);
    }

    /// Re-anchor an entry after a sweep-driven placement change.
    ///
    /// Keeps sweep idempotent: a just-moved entry starts from the neutral
    /// initial weight instead of immediately re-qualifying.
    pub fn reanchor(&self, entry: &mut MemoryEntry, now: DateTime<Utc>) {
        entry.retention = RetentionState::anchored(self.initial_weight, now);
    }

    /// Classify an entry for the sweep pass.
    pub fn classify(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> SweepAction {
        if matches!(entry.expires_at, Some(at) if at <= now) {
            return SweepAction::Delete;
        }

        let weight = self.compute_weight(entry, now);
        if weight > self.promotion_threshold && entry.stratum != Stratum::Semantic {
            return SweepAction::Promote;
        }
        if weight < self.demotion_floor {
            return if entry.stratum == Stratum::Working {
                SweepAction::Delete
            } else {
                SweepAction::Demote
            };
        }
        SweepAction::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntryDraft, EntrySource};
    use chrono::Duration;

    fn gate() -> RetentionGate {
        RetentionGate::from_config(&EngineConfig::default())
    }

    fn entry(importance: u8, initial_weight: f64, now: DateTime<Utc>) -> MemoryEntry {
        MemoryEntry::from_draft(
            EntryDraft::text("body", importance, EntrySource::new("a", "c")),
            initial_weight,
            now,
        )
    }

    #[test]
    fn weight_decays_monotonically() {
        let gate = gate();
        let now = Utc::now();
        let e = entry(3, 0.9, now);

        let mut prev = gate.compute_weight(&e, now);
        assert!((prev - 0.9).abs() < 1e-9);
        for hours in [1, 6, 24, 96, 400] {
            let w = gate.compute_weight(&e, now + Duration::hours(hours));
            assert!(w <= prev, "weight increased at +{hours}h");
            assert!(w > 0.0);
            prev = w;
        }
    }

    #[test]
    fn importance_and_access_slow_decay() {
        let gate = gate();
        let now = Utc::now();
        let later = now + Duration::hours(48);

        let dull = entry(1, 0.9, now);
        let vivid = entry(5, 0.9, now);
        assert!(gate.compute_weight(&vivid, later) > gate.compute_weight(&dull, later));

        let mut touched = entry(1, 0.9, now);
        for _ in 0..20 {
            touched.touch(now);
        }
        assert!(gate.compute_weight(&touched, later) > gate.compute_weight(&dull, later));
    }

    #[test]
    fn reward_refreshes_initial_weight_and_anchor() {
        let gate = gate();
        let now = Utc::now();
        let mut e = entry(3, 0.6, now);

        // Decay until well below the starting weight.
        let later = now + Duration::days(14);
        let decayed = gate.compute_weight(&e, later);
        assert!(decayed < 0.4, "expected deep decay, got {decayed}");

        gate.apply_reward(&mut e, 1.5, later);
        let refreshed = gate.compute_weight(&e, later);
        assert!((refreshed - 0.9).abs() < 1e-9, "0.6 * 1.5 = 0.9");
        assert!(refreshed > decayed);
    }

    #[test]
    fn reward_caps_at_one() {
        let gate = gate();
        let now = Utc::now();
        let mut e = entry(3, 0.9, now);
        gate.apply_reward(&mut e, 5.0, now);
        assert!((gate.compute_weight(&e, now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn classify_promotes_above_threshold() {
        let gate = gate();
        let now = Utc::now();
        let e = entry(3, 0.95, now);
        assert_eq!(gate.classify(&e, now), SweepAction::Promote);
    }

    #[test]
    fn classify_never_promotes_semantic() {
        let gate = gate();
        let now = Utc::now();
        let mut e = entry(3, 0.95, now);
        e.stratum = Stratum::Semantic;
        assert_eq!(gate.classify(&e, now), SweepAction::Keep);
    }

    #[test]
    fn classify_below_floor_demotes_or_deletes() {
        let gate = gate();
        let now = Utc::now();

        let mut low = entry(3, 0.05, now);
        low.stratum = Stratum::Episodic;
        assert_eq!(gate.classify(&low, now), SweepAction::Demote);

        low.stratum = Stratum::Working;
        assert_eq!(gate.classify(&low, now), SweepAction::Delete);
    }

    #[test]
    fn classify_honors_ttl_before_weight() {
        let gate = gate();
        let now = Utc::now();
        let mut e = entry(5, 0.95, now);
        e.expires_at = Some(now - Duration::seconds(1));
        assert_eq!(gate.classify(&e, now), SweepAction::Delete);
    }

    #[test]
    fn reanchor_resets_to_neutral_weight() {
        let gate = gate();
        let now = Utc::now();
        let mut e = entry(3, 0.95, now);
        gate.reanchor(&mut e, now);
        let w = gate.compute_weight(&e, now);
        assert!((w - gate.initial_weight()).abs() < 1e-9);
        assert_eq!(gate.classify(&e, now), SweepAction::Keep);
    }
}
