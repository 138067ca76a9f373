//! Engine configuration surface.
//!
//! Every recognized tuning knob lives here with its default. Construct via
//! `EngineConfig::default()` and override fields as needed.

use serde::{Deserialize, Serialize};

use crate::domain::{Phase, Stratum};

/// Per-cognitive-phase utility weights (lambda).
///
/// The retrieval score blends similarity and learned utility as
/// `(1 - lambda) * similarity + lambda * q`. Planning and reflection lean
/// on utility; observation and action lean on similarity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseWeights {
    pub observe: f64,
    pub reason: f64,
    pub plan: f64,
    pub act: f64,
    pub reflect: f64,
}

impl PhaseWeights {
    pub fn for_phase(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Observe => self.observe,
            Phase::Reason => self.reason,
            Phase::Plan => self.plan,
            Phase::Act => self.act,
            Phase::Reflect => self.reflect,
        }
    }
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            observe: 0.2,
            reason: 0.5,
            plan: 0.7,
            act: 0.3,
            reflect: 0.6,
        }
    }
}

/// Bounded exponential backoff for the persistence boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first try.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 50,
        }
    }
}

/// Per-stratum TTLs in seconds; `None` means no expiry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumTtls {
    pub working: Option<u64>,
    pub short_term: Option<u64>,
    pub episodic: Option<u64>,
    pub long_term: Option<u64>,
    pub semantic: Option<u64>,
}

impl StratumTtls {
    pub fn for_stratum(&self, stratum: Stratum) -> Option<u64> {
        match stratum {
            Stratum::Working => self.working,
            Stratum::ShortTerm => self.short_term,
            Stratum::Episodic => self.episodic,
            Stratum::LongTerm => self.long_term,
            Stratum::Semantic => self.semantic,
        }
    }
}

impl Default for StratumTtls {
    fn default() -> Self {
        Self {
            working: Some(60 * 60),
            short_term: Some(24 * 60 * 60),
            episodic: Some(7 * 24 * 60 * 60),
            long_term: None,
            semantic: None,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Surprise above this elevates encoding (importance bump + Episodic).
    pub surprise_threshold: f64,
    /// Denominator floor for surprise normalization.
    pub surprise_epsilon: f64,
    /// EMA smoothing for surprise momentum.
    pub momentum_beta: f64,
    /// Surprise observations older than this stop affecting momentum.
    pub momentum_horizon_secs: u64,
    /// Surprise audit rows persist this long.
    pub surprise_record_ttl_secs: u64,

    /// Base decay rate per hour before importance/access damping.
    pub decay_base_rate: f64,
    /// Weight new entries start from.
    pub initial_retention_weight: f64,
    /// Sweep promotes entries whose weight exceeds this.
    pub promotion_threshold: f64,
    /// Sweep demotes (or deletes at Working) below this.
    pub demotion_floor: f64,

    /// Q-value learning rate (alpha).
    pub q_learning_rate: f64,
    /// Q assigned at registration.
    pub initial_q: f64,
    /// Per-phase utility weights.
    pub lambda: PhaseWeights,
    /// Positive rewards also refresh retention by `1 + reward * this`.
    pub reward_retention_boost: f64,

    /// Self-repair attempt cap.
    pub max_repair_attempts: u32,
    /// Act-phase confidence below this forces Verifier mode.
    pub confidence_floor: f64,

    /// Outer loop fires after this many new Episodic entries.
    pub consolidation_trigger: usize,
    /// Outer loop timer cadence for daemon hosts.
    pub consolidation_interval_secs: u64,
    /// Clusters need at least this frequency to register a pattern.
    pub pattern_min_frequency: u32,
    /// Bounded length for compression summaries.
    pub summary_max_chars: usize,
    /// Jaccard tag overlap needed to co-cluster entries.
    pub tag_overlap_threshold: f64,

    pub entry_ttls: StratumTtls,
    pub storage_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            surprise_threshold: 0.7,
            surprise_epsilon: 0.1,
            momentum_beta: 0.9,
            momentum_horizon_secs: 60 * 60,
            surprise_record_ttl_secs: 30 * 24 * 60 * 60,

            decay_base_rate: 0.1,
            initial_retention_weight: 0.5,
            promotion_threshold: 0.8,
            demotion_floor: 0.1,

            q_learning_rate: 0.1,
            initial_q: 0.5,
            lambda: PhaseWeights::default(),
            reward_retention_boost: 0.5,

            max_repair_attempts: 3,
            confidence_floor: 0.5,

            consolidation_trigger: 16,
            consolidation_interval_secs: 300,
            pattern_min_frequency: 2,
            summary_max_chars: 480,
            tag_overlap_threshold: 0.25,

            entry_ttls: StratumTtls::default(),
            storage_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let c = EngineConfig::default();
        assert!((c.surprise_threshold - 0.7).abs() < f64::EPSILON);
        assert!((c.momentum_beta - 0.9).abs() < f64::EPSILON);
        assert!((c.q_learning_rate - 0.1).abs() < f64::EPSILON);
        assert!((c.promotion_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(c.max_repair_attempts, 3);
    }

    #[test]
    fn deliberative_phases_weight_utility_more() {
        let w = PhaseWeights::default();
        assert!(w.plan > w.observe);
        assert!(w.plan > w.act);
        assert!(w.reflect > w.observe);
        assert!(w.reflect > w.act);
    }

    #[test]
    fn ttls_unbounded_for_consolidated_tiers() {
        let ttls = StratumTtls::default();
        assert!(ttls.for_stratum(Stratum::Working).is_some());
        assert!(ttls.for_stratum(Stratum::LongTerm).is_none());
        assert!(ttls.for_stratum(Stratum::Semantic).is_none());
    }

    #[test]
    fn config_serde_roundtrip() {
        let c = EngineConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}
