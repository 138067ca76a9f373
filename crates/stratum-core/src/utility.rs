//! Reward-driven utility scoring (Q-values) biasing retrieval.
//!
//! Every stored entry registers here with a neutral Q. Reward signals move
//! Q via `Q' = Q + alpha * (reward - Q)` with reward clamped to [-1, 1] and
//! Q clamped to [0, 1]. Retrieval ranking always blends similarity with Q
//! by the per-phase lambda, never raw similarity or raw Q alone.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::PhaseWeights;
use crate::domain::{EngineError, EntryId, Phase, Result};

/// Q-value bookkeeping for registered entries.
///
/// Interior mutability keeps concurrent reward injection safe: updates to
/// the same entry serialize on the map lock.
pub struct UtilityScorer {
    alpha: f64,
    initial_q: f64,
    lambda: PhaseWeights,
    q: Mutex<HashMap<EntryId, f64>>,
}

impl UtilityScorer {
    pub fn new(alpha: f64, initial_q: f64, lambda: PhaseWeights) -> Self {
        Self {
            alpha,
            initial_q: initial_q.clamp(0.0, 1.0),
            lambda,
            q: Mutex::new(HashMap::new()),
        }
    }

    /// Register an entry with the default initial Q. Idempotent.
    pub fn register(&self, id: &EntryId) {
        self.register_with(id, self.initial_q);
    }

    /// Register an entry with an explicit starting Q (clamped to [0,1]).
    ///
    /// Used when a placement change carries learned utility across to the
    /// replacement entry.
    pub fn register_with(&self, id: &EntryId, q: f64) {
        let mut map = self.q.lock().unwrap();
        map.entry(id.clone()).or_insert(q.clamp(0.0, 1.0));
    }

    /// Drop bookkeeping for a deleted entry.
    pub fn forget(&self, id: &EntryId) {
        self.q.lock().unwrap().remove(id);
    }

    /// Current Q for an entry, if registered.
    pub fn q(&self, id: &EntryId) -> Option<f64> {
        self.q.lock().unwrap().get(id).copied()
    }

    /// Apply a reward signal. Unknown ids fail; no silent auto-create.
    pub fn update(&self, id: &EntryId, reward: f64) -> Result<f64> {
        let reward = reward.clamp(-1.0, 1.0);
        let mut map = self.q.lock().unwrap();
        let q = map.get_mut(id).ok_or_else(|| EngineError::UnknownEntry {
            id: id.to_string(),
        })?;
        *q = (*q + self.alpha * (reward - *q)).clamp(0.0, 1.0);
        Ok(*q)
    }

    /// Per-phase utility weight.
    pub fn lambda_for(&self, phase: Phase) -> f64 {
        self.lambda.for_phase(phase)
    }

    /// Combined relevance: `(1 - lambda) * similarity + lambda * q`.
    ///
    /// Q is already clamped to [0,1], so it enters the blend directly.
    pub fn retrieval_score(&self, q: f64, similarity: f64, phase: Phase) -> f64 {
        let lambda = self.lambda_for(phase);
        (1.0 - lambda) * similarity + lambda * q
    }

    /// Snapshot of all (id, Q) pairs for analytics.
    pub fn snapshot(&self) -> Vec<(EntryId, f64)> {
        let map = self.q.lock().unwrap();
        let mut pairs: Vec<_> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> UtilityScorer {
        UtilityScorer::new(0.1, 0.5, PhaseWeights::default())
    }

    fn id(s: &str) -> EntryId {
        EntryId(s.to_string())
    }

    #[test]
    fn register_is_idempotent() {
        let s = scorer();
        let e = id("e1");
        s.register(&e);
        s.update(&e, 1.0).unwrap();
        let q_after = s.q(&e).unwrap();
        s.register(&e);
        assert_eq!(s.q(&e).unwrap(), q_after);
    }

    #[test]
    fn update_moves_toward_reward() {
        let s = scorer();
        let e = id("e1");
        s.register(&e);

        let q1 = s.update(&e, 1.0).unwrap();
        assert!((q1 - 0.55).abs() < 1e-9, "0.5 + 0.1 * (1.0 - 0.5)");

        let q2 = s.update(&e, -1.0).unwrap();
        assert!(q2 < q1);
    }

    #[test]
    fn q_stays_bounded_under_any_reward_sequence() {
        let s = scorer();
        let e = id("e1");
        s.register(&e);

        // Extreme and out-of-range rewards, alternating signs.
        for (i, reward) in [5.0, -7.0, 1.0, 1.0, 1.0, -1.0, 100.0, -100.0, 0.3]
            .iter()
            .cycle()
            .take(500)
            .enumerate()
        {
            let signed = if i % 3 == 0 { -reward } else { *reward };
            let q = s.update(&e, signed).unwrap();
            assert!((0.0..=1.0).contains(&q), "Q out of bounds: {q}");
        }
    }

    #[test]
    fn update_unknown_entry_fails() {
        let s = scorer();
        let err = s.update(&id("ghost"), 0.5).unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntry { .. }));
    }

    #[test]
    fn retrieval_score_blends_by_phase() {
        let s = scorer();
        // Planning (lambda 0.7) leans on Q.
        let planning = s.retrieval_score(0.9, 0.1, Phase::Plan);
        // Observation (lambda 0.2) leans on similarity.
        let observing = s.retrieval_score(0.9, 0.1, Phase::Observe);
        assert!(planning > observing);
    }

    #[test]
    fn high_q_wins_at_planning_lambda() {
        let s = scorer();
        let high_q = s.retrieval_score(0.9, 0.1, Phase::Plan);
        let high_sim = s.retrieval_score(0.1, 0.9, Phase::Plan);
        assert!(high_q > high_sim);
    }

    #[test]
    fn raising_lambda_never_degrades_higher_q_rank() {
        // Two entries, equal similarity, different Q. As lambda grows the
        // high-Q entry's margin must be non-decreasing.
        let sim = 0.4;
        let (q_hi, q_lo) = (0.8, 0.2);
        let mut prev_margin = f64::MIN;
        for step in 0..=10 {
            let lambda = f64::from(step) / 10.0;
            let hi = (1.0 - lambda) * sim + lambda * q_hi;
            let lo = (1.0 - lambda) * sim + lambda * q_lo;
            let margin = hi - lo;
            assert!(margin >= prev_margin - 1e-12);
            assert!(margin >= 0.0);
            prev_margin = margin;
        }
    }

    #[test]
    fn forget_removes_bookkeeping() {
        let s = scorer();
        let e = id("e1");
        s.register(&e);
        s.forget(&e);
        assert!(s.q(&e).is_none());
        assert!(s.update(&e, 0.5).is_err());
    }

    #[test]
    fn snapshot_lists_registered_entries() {
        let s = scorer();
        s.register(&id("b"));
        s.register(&id("a"));
        let snap = s.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, id("a"));
    }
}
