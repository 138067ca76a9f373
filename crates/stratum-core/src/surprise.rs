//! Surprise scoring with momentum normalization.
//!
//! A surprise score measures how far an actual outcome landed from the
//! expected one, normalized by recent volatility for the same
//! (agent, context) pair: `score = distance / (momentum + epsilon)`.
//! Momentum is an exponential moving average of recent scores, bounded by a
//! time horizon so stale surprises stop influencing it. Audit rows persist
//! separately with their own TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::config::EngineConfig;
use crate::domain::{EntryId, Outcome, SurpriseRecord};
use stratum_state::Clock;

/// Upper bound on retained window samples per context key.
const WINDOW_CAP: usize = 64;

// ---------------------------------------------------------------------------
// Distance functions
// ---------------------------------------------------------------------------

/// Domain-defined distance over outcome representations.
pub trait OutcomeDistance: Send + Sync {
    /// Non-negative distance between expected and actual.
    fn distance(&self, expected: &Outcome, actual: &Outcome) -> f64;
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 1.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        na += f64::from(*x) * f64::from(*x);
        nb += f64::from(*y) * f64::from(*y);
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na.sqrt() * nb.sqrt())).max(0.0)
}

/// Kind-aware default: numeric delta, label mismatch indicator, embedding
/// cosine distance. Mismatched kinds count as maximal deviation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDistance;

impl OutcomeDistance for DefaultDistance {
    fn distance(&self, expected: &Outcome, actual: &Outcome) -> f64 {
        match (expected, actual) {
            (Outcome::Numeric(a), Outcome::Numeric(b)) => (a - b).abs(),
            (Outcome::Label(a), Outcome::Label(b)) => {
                if a == b {
                    0.0
                } else {
                    1.0
                }
            }
            (Outcome::Embedding(a), Outcome::Embedding(b)) => cosine_distance(a, b),
            _ => 1.0,
        }
    }
}

/// Pure mismatch indicator: 0 on equality, 1 otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoricalDistance;

impl OutcomeDistance for CategoricalDistance {
    fn distance(&self, expected: &Outcome, actual: &Outcome) -> f64 {
        if expected == actual {
            0.0
        } else {
            1.0
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Result of scoring one expected/actual pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    /// Unbounded surprise score, >= 0.
    pub score: f64,
    /// Momentum used in the denominator (pre-update).
    pub momentum: f64,
    /// Whether the score crossed the elevated-encoding threshold.
    pub elevated: bool,
}

/// Per-agent/context surprise scorer.
pub struct SurpriseEngine {
    beta: f64,
    epsilon: f64,
    threshold: f64,
    horizon: Duration,
    record_ttl: Duration,
    distance: Box<dyn OutcomeDistance>,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<(DateTime<Utc>, f64)>>>,
}

impl SurpriseEngine {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            beta: config.momentum_beta,
            epsilon: config.surprise_epsilon,
            threshold: config.surprise_threshold,
            horizon: Duration::seconds(config.momentum_horizon_secs as i64),
            record_ttl: Duration::seconds(config.surprise_record_ttl_secs as i64),
            distance: Box::new(DefaultDistance),
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the pluggable distance function.
    pub fn with_distance(mut self, distance: Box<dyn OutcomeDistance>) -> Self {
        self.distance = distance;
        self
    }

    fn window_key(agent_id: &str, context_key: &str) -> String {
        format!("{agent_id}/{context_key}")
    }

    fn ema_over(&self, window: &VecDeque<(DateTime<Utc>, f64)>) -> f64 {
        let mut momentum = 0.0;
        for (_, s) in window {
            momentum = self.beta * momentum + (1.0 - self.beta) * s;
        }
        momentum
    }

    /// Score one expected/actual pair and fold the result into momentum.
    pub fn score(
        &self,
        agent_id: &str,
        context_key: &str,
        expected: &Outcome,
        actual: &Outcome,
    ) -> Scored {
        let now = self.clock.now();
        let d = self.distance.distance(expected, actual);

        let mut windows = self.windows.lock().unwrap();
        let window = windows
            .entry(Self::window_key(agent_id, context_key))
            .or_default();

        // Observations past the horizon stop affecting the EMA.
        let cutoff = now - self.horizon;
        while matches!(window.front(), Some((t, _)) if *t < cutoff) {
            window.pop_front();
        }

        let momentum = self.ema_over(window);
        let score = d / (momentum + self.epsilon);

        window.push_back((now, score));
        if window.len() > WINDOW_CAP {
            window.pop_front();
        }

        Scored {
            score,
            momentum,
            elevated: score > self.threshold,
        }
    }

    /// Current momentum for a context, after horizon pruning.
    pub fn momentum(&self, agent_id: &str, context_key: &str) -> f64 {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap();
        let Some(window) = windows.get_mut(&Self::window_key(agent_id, context_key)) else {
            return 0.0;
        };
        let cutoff = now - self.horizon;
        while matches!(window.front(), Some((t, _)) if *t < cutoff) {
            window.pop_front();
        }
        self.ema_over(window)
    }

    /// Build the write-once audit record for a scored pair.
    pub fn make_record(
        &self,
        agent_id: &str,
        context_key: &str,
        scored: Scored,
        expected: Outcome,
        actual: Outcome,
        produced_entry: Option<EntryId>,
    ) -> SurpriseRecord {
        let now = self.clock.now();
        SurpriseRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            context_key: context_key.to_string(),
            score: scored.score,
            expected,
            actual,
            produced_entry,
            recorded_at: now,
            expires_at: now + self.record_ttl,
        }
    }
}
