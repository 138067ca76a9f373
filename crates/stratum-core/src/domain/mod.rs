//! Core data model for the retention engine.
//!
//! Defines the atomic memory unit ([`MemoryEntry`]), the five-tier stratum
//! ordering, cognitive phases, cycle events, surprise audit records, and
//! consolidation-derived patterns.

pub mod error;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_state::ContentDigest;

pub use error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a memory entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    /// Generate a new random EntryId.
    pub fn new() -> Self {
        EntryId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a detected pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(pub String);

impl PatternId {
    pub fn new() -> Self {
        PatternId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stratum
// ---------------------------------------------------------------------------

/// One tier of the memory hierarchy, ordered by retention horizon.
///
/// Promotion moves toward `Semantic`; demotion moves toward `Working`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stratum {
    Working,
    ShortTerm,
    Episodic,
    LongTerm,
    Semantic,
}

impl Stratum {
    /// All strata in retention order, shortest horizon first.
    pub fn all() -> [Stratum; 5] {
        [
            Stratum::Working,
            Stratum::ShortTerm,
            Stratum::Episodic,
            Stratum::LongTerm,
            Stratum::Semantic,
        ]
    }

    /// The next stratum toward `Semantic`, if any.
    pub fn promoted(self) -> Option<Stratum> {
        match self {
            Stratum::Working => Some(Stratum::ShortTerm),
            Stratum::ShortTerm => Some(Stratum::Episodic),
            Stratum::Episodic => Some(Stratum::LongTerm),
            Stratum::LongTerm => Some(Stratum::Semantic),
            Stratum::Semantic => None,
        }
    }

    /// The next stratum toward `Working`, if any.
    pub fn demoted(self) -> Option<Stratum> {
        match self {
            Stratum::Working => None,
            Stratum::ShortTerm => Some(Stratum::Working),
            Stratum::Episodic => Some(Stratum::ShortTerm),
            Stratum::LongTerm => Some(Stratum::Episodic),
            Stratum::Semantic => Some(Stratum::LongTerm),
        }
    }

    /// Stable string form used as an indexed storage column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stratum::Working => "working",
            Stratum::ShortTerm => "short_term",
            Stratum::Episodic => "episodic",
            Stratum::LongTerm => "long_term",
            Stratum::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for Stratum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Cognitive phase of the inner loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Observe,
    Reason,
    Plan,
    Act,
    Reflect,
}

impl Phase {
    /// Successor in the Observe -> Reason -> Plan -> Act -> Reflect cycle.
    pub fn next(self) -> Phase {
        match self {
            Phase::Observe => Phase::Reason,
            Phase::Reason => Phase::Plan,
            Phase::Plan => Phase::Act,
            Phase::Act => Phase::Reflect,
            Phase::Reflect => Phase::Observe,
        }
    }

    /// Strata a phase reads from when assembling context.
    ///
    /// Early phases stay close to the present; deliberative phases reach
    /// into consolidated tiers.
    pub fn read_strata(self) -> &'static [Stratum] {
        match self {
            Phase::Observe => &[Stratum::Working, Stratum::ShortTerm],
            Phase::Reason => &[Stratum::ShortTerm, Stratum::Episodic, Stratum::Semantic],
            Phase::Plan => &[Stratum::Episodic, Stratum::LongTerm, Stratum::Semantic],
            Phase::Act => &[Stratum::Working],
            Phase::Reflect => &[Stratum::Working, Stratum::ShortTerm, Stratum::Episodic],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Observe => "observe",
            Phase::Reason => "reason",
            Phase::Plan => "plan",
            Phase::Act => "act",
            Phase::Reflect => "reflect",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Content & provenance
// ---------------------------------------------------------------------------

/// Opaque payload of a memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum EntryContent {
    Text(String),
    Structured(serde_json::Value),
    Embedding(Vec<f32>),
}

impl EntryContent {
    /// Content digest over the canonical JSON form, for lineage/audit.
    pub fn digest(&self) -> ContentDigest {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        ContentDigest::from_bytes(&canonical)
    }

    /// Best-effort text rendering, used by compression heuristics.
    pub fn as_text(&self) -> String {
        match self {
            EntryContent::Text(s) => s.clone(),
            EntryContent::Structured(v) => v.to_string(),
            EntryContent::Embedding(v) => format!("<embedding dim={}>", v.len()),
        }
    }
}

/// Provenance of an entry: who produced it and in which cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySource {
    pub agent_id: String,
    pub channel_id: String,
    pub cycle: u64,
    pub phase: Phase,
}

impl EntrySource {
    pub fn new(agent_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
            cycle: 0,
            phase: Phase::Observe,
        }
    }

    pub fn at_cycle(mut self, cycle: u64) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }
}

// ---------------------------------------------------------------------------
// Retention state
// ---------------------------------------------------------------------------

/// Decay bookkeeping for an entry.
///
/// `initial_weight` is the value the decay curve starts from;
/// `anchored_at` is the instant the curve was last reset (creation,
/// reward application, or sweep-driven placement change).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionState {
    pub initial_weight: f64,
    pub anchored_at: DateTime<Utc>,
}

impl RetentionState {
    pub fn anchored(initial_weight: f64, at: DateTime<Utc>) -> Self {
        Self {
            initial_weight: initial_weight.clamp(f64::MIN_POSITIVE, 1.0),
            anchored_at: at,
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryEntry
// ---------------------------------------------------------------------------

/// The atomic unit of agent memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: EntryId,
    pub stratum: Stratum,
    pub content: EntryContent,
    /// Importance 1-5, set at creation, amplified by surprise.
    pub importance: u8,
    pub tags: BTreeSet<String>,
    pub source: EntrySource,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Lineage: ids this entry was compressed from or relates to.
    pub related: BTreeSet<EntryId>,
    pub retention: RetentionState,
    /// Q-value, owned by the utility scorer.
    pub utility: f64,
    pub content_digest: ContentDigest,
}

impl MemoryEntry {
    /// Materialize a draft into a live entry at `now`.
    pub fn from_draft(draft: EntryDraft, initial_weight: f64, now: DateTime<Utc>) -> Self {
        let digest = draft.content.digest();
        Self {
            id: EntryId::new(),
            stratum: draft.stratum,
            content: draft.content,
            importance: draft.importance.clamp(1, 5),
            tags: draft.tags,
            source: draft.source,
            access_count: 0,
            last_accessed_at: now,
            created_at: now,
            expires_at: draft.expires_at,
            related: draft.related,
            retention: RetentionState::anchored(initial_weight, now),
            utility: 0.0,
            content_digest: digest,
        }
    }

    /// Record a retrieval at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }
}

/// Input for creating a new entry.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub stratum: Stratum,
    pub content: EntryContent,
    pub importance: u8,
    pub tags: BTreeSet<String>,
    pub source: EntrySource,
    pub expires_at: Option<DateTime<Utc>>,
    pub related: BTreeSet<EntryId>,
}

impl EntryDraft {
    pub fn new(content: EntryContent, importance: u8, source: EntrySource) -> Self {
        Self {
            stratum: Stratum::Working,
            content,
            importance,
            tags: BTreeSet::new(),
            source,
            expires_at: None,
            related: BTreeSet::new(),
        }
    }

    pub fn text(body: impl Into<String>, importance: u8, source: EntrySource) -> Self {
        Self::new(EntryContent::Text(body.into()), importance, source)
    }

    pub fn in_stratum(mut self, stratum: Stratum) -> Self {
        self.stratum = stratum;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I: IntoIterator<Item = String>>(mut self, tags: I) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn related_to(mut self, id: EntryId) -> Self {
        self.related.insert(id);
        self
    }
}

// ---------------------------------------------------------------------------
// Outcomes & cycle events
// ---------------------------------------------------------------------------

/// Snapshot of an expected or actual outcome, compared by the surprise
/// engine's pluggable distance function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Outcome {
    Numeric(f64),
    Label(String),
    Embedding(Vec<f32>),
}

/// One tick of the cycle-event feed consumed by the inner loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEvent {
    pub agent_id: String,
    pub channel_id: String,
    pub cycle: u64,
    pub phase: Phase,
    pub expected: Outcome,
    pub actual: Outcome,
    /// Free-form description of what was observed.
    pub description: String,
    pub tags: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// SurpriseRecord
// ---------------------------------------------------------------------------

/// Write-once audit record for one scored cycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurpriseRecord {
    pub id: String,
    pub agent_id: String,
    pub context_key: String,
    pub score: f64,
    pub expected: Outcome,
    pub actual: Outcome,
    pub produced_entry: Option<EntryId>,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MemoryPattern
// ---------------------------------------------------------------------------

/// Kind of consolidation-derived pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// The same theme recurs across entries.
    Recurrence,
    /// Tags that consistently appear together.
    Cooccurrence,
    /// A repeated action/outcome pairing.
    OutcomeLink,
}

/// Derived aggregate written only by the outer consolidation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPattern {
    pub id: PatternId,
    pub kind: PatternKind,
    pub description: String,
    pub frequency: u32,
    /// Confidence in [0,1].
    pub confidence: f64,
    pub related: BTreeSet<EntryId>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
