//! Compression of related entries into coarser strata.
//!
//! Groups input entries by semantic proximity (pluggable strategy) and
//! produces one reduced-detail output per cluster. The reduction depends on
//! the level being crossed:
//!
//! - Working -> ShortTerm: near-identity (concatenate, dedupe exact repeats)
//! - ShortTerm -> Episodic: bounded summary preserving named entities
//! - Episodic -> LongTerm: recurring-theme extraction, registering a
//!   `MemoryPattern` when the theme recurs often enough
//! - LongTerm -> Semantic: abstraction stripping instance-specific context
//!
//! Lineage is always preserved: each output's `related` set contains every
//! input id. Inputs are never deleted here; that decision belongs to the
//! caller or the sweep.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::domain::{
    EngineError, EntryContent, EntryDraft, MemoryEntry, MemoryPattern, PatternId, PatternKind,
    Result, Stratum,
};

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

/// Groups entries by semantic proximity. Returns index clusters over the
/// input slice; every index appears in exactly one cluster.
pub trait ClusterStrategy: Send + Sync {
    fn cluster(&self, entries: &[MemoryEntry]) -> Vec<Vec<usize>>;
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Greedy clustering on tag-set Jaccard overlap.
#[derive(Debug, Clone, Copy)]
pub struct TagOverlapClusters {
    pub threshold: f64,
}

impl ClusterStrategy for TagOverlapClusters {
    fn cluster(&self, entries: &[MemoryEntry]) -> Vec<Vec<usize>> {
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut assigned = vec![false; entries.len()];

        for seed in 0..entries.len() {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let mut cluster = vec![seed];
            for other in (seed + 1)..entries.len() {
                if assigned[other] {
                    continue;
                }
                if jaccard(&entries[seed].tags, &entries[other].tags) >= self.threshold {
                    assigned[other] = true;
                    cluster.push(other);
                }
            }
            clusters.push(cluster);
        }
        clusters
    }
}

/// Greedy clustering on embedding cosine similarity; entries without
/// embedding content become singletons.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingClusters {
    pub threshold: f64,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
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
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

impl ClusterStrategy for EmbeddingClusters {
    fn cluster(&self, entries: &[MemoryEntry]) -> Vec<Vec<usize>> {
        let embedding_of = |e: &MemoryEntry| match &e.content {
            EntryContent::Embedding(v) => Some(v.clone()),
            _ => None,
        };

        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut assigned = vec![false; entries.len()];

        for seed in 0..entries.len() {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let mut cluster = vec![seed];
            if let Some(seed_vec) = embedding_of(&entries[seed]) {
                for other in (seed + 1)..entries.len() {
                    if assigned[other] {
                        continue;
                    }
                    if let Some(other_vec) = embedding_of(&entries[other]) {
                        if cosine_similarity(&seed_vec, &other_vec) >= self.threshold {
                            assigned[other] = true;
                            cluster.push(other);
                        }
                    }
                }
            }
            clusters.push(cluster);
        }
        clusters
    }
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// One compressed entry plus any patterns the cluster surfaced.
#[derive(Debug, Clone)]
pub struct CompressionOutput {
    pub draft: EntryDraft,
    pub patterns: Vec<MemoryPattern>,
}

/// Produces reduced-detail representations for promotion.
pub struct MemoryCompressor {
    strategy: Box<dyn ClusterStrategy>,
    summary_max_chars: usize,
    pattern_min_frequency: u32,
}

impl MemoryCompressor {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            strategy: Box::new(TagOverlapClusters {
                threshold: config.tag_overlap_threshold,
            }),
            summary_max_chars: config.summary_max_chars,
            pattern_min_frequency: config.pattern_min_frequency,
        }
    }

    /// Replace the pluggable clustering strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn ClusterStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Compress `entries` for promotion into `target`.
    ///
    /// Fails with `EmptyInput` on zero entries, `IncompatibleStrata` when
    /// inputs span more than one stratum, and `InvalidTransition` when the
    /// target is not exactly one level above the source.
    pub fn compress(
        &self,
        entries: &[MemoryEntry],
        target: Stratum,
        now: DateTime<Utc>,
    ) -> Result<Vec<CompressionOutput>> {
        if entries.is_empty() {
            return Err(EngineError::EmptyInput);
        }

        let strata: BTreeSet<Stratum> = entries.iter().map(|e| e.stratum).collect();
        if strata.len() > 1 {
            return Err(EngineError::IncompatibleStrata {
                found: strata.into_iter().collect(),
            });
        }
        let source = entries[0].stratum;
        if source.promoted() != Some(target) {
            return Err(EngineError::InvalidTransition {
                from: source,
                to: target,
            });
        }

        let clusters = self.strategy.cluster(entries);
        let mut outputs = Vec::with_capacity(clusters.len());
        for indices in clusters {
            let members: Vec<&MemoryEntry> = indices.iter().map(|i| &entries[*i]).collect();
            outputs.push(self.compress_cluster(&members, source, target, now));
        }
        Ok(outputs)
    }

    fn compress_cluster(
        &self,
        members: &[&MemoryEntry],
        source: Stratum,
        target: Stratum,
        now: DateTime<Utc>,
    ) -> CompressionOutput {
        let texts: Vec<String> = members.iter().map(|e| e.content.as_text()).collect();
        let mut patterns = Vec::new();

        let body = match source {
            Stratum::Working => concat_dedupe(&texts),
            Stratum::ShortTerm => summarize(&texts, self.summary_max_chars),
            Stratum::Episodic => {
                let (statement, pattern) = self.extract_recurrence(members, &texts, now);
                if let Some(p) = pattern {
                    patterns.push(p);
                }
                statement
            }
            Stratum::LongTerm => abstract_statement(members, &texts),
            // Unreachable: Semantic has no promotion target.
            Stratum::Semantic => concat_dedupe(&texts),
        };

        let importance = members.iter().map(|e| e.importance).max().unwrap_or(1);
        let mut tags: BTreeSet<String> = BTreeSet::new();
        for e in members {
            tags.extend(e.tags.iter().cloned());
        }
        let related: BTreeSet<_> = members.iter().map(|e| e.id.clone()).collect();

        let max_cycle = members.iter().map(|e| e.source.cycle).max().unwrap_or(0);
        let source_meta = members[0].source.clone().at_cycle(max_cycle);

        let mut draft = EntryDraft::new(EntryContent::Text(body), importance, source_meta)
            .in_stratum(target)
            .with_tags(tags.into_iter());
        draft.related = related;

        CompressionOutput { draft, patterns }
    }

    /// Recurring-theme extraction for Episodic -> LongTerm, registering a
    /// pattern when the dominant theme recurs across enough entries.
    fn extract_recurrence(
        &self,
        members: &[&MemoryEntry],
        texts: &[String],
        now: DateTime<Utc>,
    ) -> (String, Option<MemoryPattern>) {
        let mut doc_counts: BTreeMap<String, u32> = BTreeMap::new();
        for text in texts {
            let words: BTreeSet<String> = significant_words(text).collect();
            for w in words {
                *doc_counts.entry(w).or_insert(0) += 1;
            }
        }

        let mut recurring: Vec<(&String, &u32)> = doc_counts
            .iter()
            .filter(|(_, c)| **c >= self.pattern_min_frequency)
            .collect();
        recurring.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        recurring.truncate(5);

        if recurring.is_empty() {
            let statement = summarize(texts, self.summary_max_chars);
            return (statement, None);
        }

        let themes: Vec<String> = recurring.iter().map(|(w, _)| (*w).clone()).collect();
        let frequency = *recurring[0].1;
        let statement = format!(
            "Recurring across {} episodes: {}",
            members.len(),
            themes.join(", ")
        );

        let pattern = MemoryPattern {
            id: PatternId::new(),
            kind: PatternKind::Recurrence,
            description: statement.clone(),
            frequency,
            confidence: f64::from(frequency) / members.len() as f64,
            related: members.iter().map(|e| e.id.clone()).collect(),
            detected_at: now,
            updated_at: now,
        };
        (statement, Some(pattern))
    }
}

/// Near-identity reduction: concatenate, dropping exact repeats.
fn concat_dedupe(texts: &[String]) -> String {
    let mut seen = BTreeSet::new();
    let mut parts = Vec::new();
    for t in texts {
        if seen.insert(t.clone()) {
            parts.push(t.as_str());
        }
    }
    parts.join("\n")
}

/// Bounded-length synthesis preserving named entities.
fn summarize(texts: &[String], max_chars: usize) -> String {
    let joined = texts.join("; ");
    if joined.chars().count() <= max_chars {
        return joined;
    }

    let entities: Vec<String> = texts
        .iter()
        .flat_map(|t| named_entities(t))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(8)
        .collect();

    let mut truncated: String = joined.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    if entities.is_empty() {
        truncated
    } else {
        format!("{truncated} [{}]", entities.join(", "))
    }
}

/// Abstraction for LongTerm -> Semantic: shared themes only, instance
/// detail (numbers, entity names) stripped.
fn abstract_statement(members: &[&MemoryEntry], texts: &[String]) -> String {
    let mut shared: Option<BTreeSet<String>> = None;
    for text in texts {
        let words: BTreeSet<String> = significant_words(text).collect();
        shared = Some(match shared {
            None => words,
            Some(prev) => prev.intersection(&words).cloned().collect(),
        });
    }
    let shared = shared.unwrap_or_default();

    if shared.is_empty() {
        let mut tags: BTreeSet<String> = BTreeSet::new();
        for e in members {
            tags.extend(e.tags.iter().cloned());
        }
        if tags.is_empty() {
            return "Generalized from prior long-term memories".to_string();
        }
        return format!(
            "In general, situations involving {} follow a stable pattern",
            tags.into_iter().collect::<Vec<_>>().join(", ")
        );
    }

    format!(
        "In general: {}",
        shared.into_iter().take(8).collect::<Vec<_>>().join(" ")
    )
}

/// Lowercased words worth counting: length > 3, no digits.
fn significant_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3 && !w.chars().any(|c| c.is_ascii_digit()))
        .map(|w| w.to_lowercase())
}

/// Capitalized tokens, a cheap stand-in for named entities.
fn named_entities(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && w.chars().next().is_some_and(|c| c.is_uppercase()))
        .map(|w| w.to_string())
        .collect()
}
