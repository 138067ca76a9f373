//! Stratum Core Library
//!
//! The multi-tier memory retention engine: decides what an agent remembers,
//! for how long, and with what priority.
//!
//! - Five-tier stratum store (Working, ShortTerm, Episodic, LongTerm,
//!   Semantic) with promotion, demotion, and compression
//! - Online surprise scoring with per-context momentum normalization
//! - Reward-driven Q-value utility scoring biasing retrieval per phase
//! - Dual-loop orchestration: a per-cycle inner loop (Observe, Reason,
//!   Plan, Act, Reflect) and a periodic outer consolidation loop, with
//!   Solver/Verifier modes and a bounded self-repair protocol

pub mod analytics;
pub mod compressor;
pub mod config;
pub mod domain;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod repair;
pub mod retention;
pub mod store;
pub mod surprise;
pub mod telemetry;
pub mod utility;

pub use analytics::{AnalyticsReport, QValueDistribution, RetentionStats, SurpriseHistogram};
pub use compressor::{
    ClusterStrategy, CompressionOutput, EmbeddingClusters, MemoryCompressor, TagOverlapClusters,
};
pub use config::{EngineConfig, PhaseWeights, RetryPolicy, StratumTtls};
pub use domain::{
    CycleEvent, EngineError, EntryContent, EntryDraft, EntryId, EntrySource, MemoryEntry,
    MemoryPattern, Outcome, PatternId, PatternKind, Phase, Result, RetentionState, Stratum,
    SurpriseRecord,
};
pub use engine::RetentionEngine;
pub use events::{EngineEvent, EventBus, Mode};
pub use orchestrator::{
    ActionOutcome, ActionRunner, CancelFlag, ConsolidationReport, CycleReport,
    DualLoopOrchestrator, LoopState,
};
pub use repair::{
    classify_failure, generate_patch, run_repair_loop, ActFailure, FailureKind, Patch,
    PatchAttempt, RepairAttemptResult, RepairLog, RepairOutcome,
};
pub use retention::{decay_rate, RetentionGate, SweepAction, SweepOutcome};
pub use store::{EntryFilter, StratumStore, SweepReport};
pub use surprise::{
    CategoricalDistance, DefaultDistance, OutcomeDistance, Scored, SurpriseEngine,
};
pub use utility::UtilityScorer;

pub use metrics::METRICS;
pub use obs::AgentSpan;
pub use telemetry::init_tracing;

pub use stratum_state::{
    Clock, ContentDigest, DocumentStore, ManualClock, MemoryDocStore, SurrealDocStore, SystemClock,
};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
