//! Analytics snapshots over the engine's learned state.
//!
//! Built on demand from store/scorer snapshots: Q-value distribution,
//! per-stratum retention statistics, and a surprise histogram.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MemoryEntry, Stratum};
use crate::retention::RetentionGate;

/// Fixed-bucket distribution of Q-values over [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QValueDistribution {
    /// Ten equal-width buckets: [0,0.1), [0.1,0.2), ... [0.9,1.0].
    pub buckets: [usize; 10],
    pub count: usize,
    pub mean: f64,
}

impl QValueDistribution {
    pub fn from_values(values: &[f64]) -> Self {
        let mut buckets = [0usize; 10];
        let mut sum = 0.0;
        for v in values {
            let clamped = v.clamp(0.0, 1.0);
            let idx = ((clamped * 10.0) as usize).min(9);
            buckets[idx] += 1;
            sum += clamped;
        }
        Self {
            buckets,
            count: values.len(),
            mean: if values.is_empty() {
                0.0
            } else {
                sum / values.len() as f64
            },
        }
    }
}

/// Retention statistics for one stratum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumStats {
    pub count: usize,
    pub mean_weight: f64,
    pub mean_importance: f64,
    pub total_accesses: u64,
}

/// Per-stratum retention statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionStats {
    pub per_stratum: BTreeMap<Stratum, StratumStats>,
}

impl RetentionStats {
    pub fn from_entries(entries: &[MemoryEntry], gate: &RetentionGate, now: DateTime<Utc>) -> Self {
        let mut grouped: BTreeMap<Stratum, Vec<&MemoryEntry>> = BTreeMap::new();
        for entry in entries {
            grouped.entry(entry.stratum).or_default().push(entry);
        }

        let per_stratum = grouped
            .into_iter()
            .map(|(stratum, members)| {
                let count = members.len();
                let weight_sum: f64 = members.iter().map(|e| gate.compute_weight(e, now)).sum();
                let importance_sum: f64 =
                    members.iter().map(|e| f64::from(e.importance)).sum();
                let total_accesses: u64 = members.iter().map(|e| e.access_count).sum();
                (
                    stratum,
                    StratumStats {
                        count,
                        mean_weight: weight_sum / count as f64,
                        mean_importance: importance_sum / count as f64,
                        total_accesses,
                    },
                )
            })
            .collect();
        Self { per_stratum }
    }
}

/// Histogram over recorded surprise scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurpriseHistogram {
    /// Bucket upper edges; the final bucket is open-ended.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    pub count: usize,
    pub mean: f64,
}

impl SurpriseHistogram {
    pub fn from_scores(scores: &[f64]) -> Self {
        let edges = vec![0.25, 0.5, 0.7, 1.0, 2.0, 5.0];
        let mut counts = vec![0usize; edges.len() + 1];
        let mut sum = 0.0;
        for s in scores {
            let idx = edges.iter().position(|e| s < e).unwrap_or(edges.len());
            counts[idx] += 1;
            sum += s;
        }
        Self {
            edges,
            counts,
            count: scores.len(),
            mean: if scores.is_empty() {
                0.0
            } else {
                sum / scores.len() as f64
            },
        }
    }
}

/// Full analytics snapshot exposed to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub q_values: QValueDistribution,
    pub retention: RetentionStats,
    pub surprise: SurpriseHistogram,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::{EntryDraft, EntrySource};

    #[test]
    fn q_distribution_buckets_and_mean() {
        let d = QValueDistribution::from_values(&[0.05, 0.15, 0.95, 1.0]);
        assert_eq!(d.count, 4);
        assert_eq!(d.buckets[0], 1);
        assert_eq!(d.buckets[1], 1);
        assert_eq!(d.buckets[9], 2, "1.0 folds into the top bucket");
        assert!((d.mean - 0.5375).abs() < 1e-9);
    }

    #[test]
    fn q_distribution_empty() {
        let d = QValueDistribution::from_values(&[]);
        assert_eq!(d.count, 0);
        assert_eq!(d.mean, 0.0);
    }

    #[test]
    fn retention_stats_group_by_stratum() {
        let now = Utc::now();
        let gate = RetentionGate::from_config(&EngineConfig::default());
        let mut entries = Vec::new();
        for (stratum, importance) in [
            (Stratum::Working, 2),
            (Stratum::Working, 4),
            (Stratum::Episodic, 5),
        ] {
            entries.push(MemoryEntry::from_draft(
                EntryDraft::text("x", importance, EntrySource::new("a", "c"))
                    .in_stratum(stratum),
                0.5,
                now,
            ));
        }

        let stats = RetentionStats::from_entries(&entries, &gate, now);
        assert_eq!(stats.per_stratum[&Stratum::Working].count, 2);
        assert!((stats.per_stratum[&Stratum::Working].mean_importance - 3.0).abs() < 1e-9);
        assert_eq!(stats.per_stratum[&Stratum::Episodic].count, 1);
        assert!(!stats.per_stratum.contains_key(&Stratum::Semantic));
    }

    #[test]
    fn surprise_histogram_open_ended_top_bucket() {
        let h = SurpriseHistogram::from_scores(&[0.1, 0.6, 0.9, 12.0]);
        assert_eq!(h.count, 4);
        assert_eq!(h.counts[0], 1);
        assert_eq!(*h.counts.last().unwrap(), 1, "12.0 lands past every edge");
        assert!(h.mean > 3.0);
    }
}
