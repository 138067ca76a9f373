//! Dual-loop orchestration: the per-cycle inner loop and the periodic
//! outer consolidation loop.
//!
//! The inner loop walks Observe -> Reason -> Plan -> Act -> Reflect each
//! cycle, reading phase-scoped strata and writing new entries. Orthogonal
//! to the phase axis is the mode axis: the orchestrator starts in Solver
//! mode and drops into Verifier mode on an Act-phase failure or a
//! low-confidence outcome, running the bounded self-repair protocol before
//! returning to Solver.
//!
//! The outer loop (detect patterns -> promote -> compress -> link ->
//! analyze) runs on a timer or when enough Episodic entries pile up, with
//! per-scope mutual exclusion so two consolidations of the same scope never
//! overlap.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::compressor::MemoryCompressor;
use crate::config::EngineConfig;
use crate::domain::{
    CycleEvent, EngineError, EntryDraft, EntryId, MemoryEntry, Phase, Result, Stratum,
};
use crate::events::{EngineEvent, EventBus, Mode};
use crate::metrics::METRICS;
use crate::obs;
use crate::repair::{
    run_repair_loop, ActFailure, RepairAttemptResult, RepairOutcome, Patch,
};
use crate::retention::SweepOutcome;
use crate::store::{EntryFilter, StratumStore};
use crate::surprise::SurpriseEngine;
use crate::utility::UtilityScorer;
use stratum_state::Clock;

// ---------------------------------------------------------------------------
// Action boundary
// ---------------------------------------------------------------------------

/// Result of one Act-phase tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub retry_count: u32,
    pub detail: String,
}

/// The tool boundary the Act phase suspends on.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Execute the planned action.
    async fn run(&self, agent_id: &str, plan: &str) -> ActionOutcome;

    /// Apply a patch and re-verify; `true` means verification passed.
    async fn apply_patch(&self, agent_id: &str, patch: &Patch) -> bool;
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

/// Explicit state for the phase x mode machine, one per agent.
///
/// Keeping both axes in one struct keeps the repair attempt cap centrally
/// enforceable instead of scattered through conditionals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopState {
    pub phase: Phase,
    pub mode: Mode,
    pub repair_attempts: u32,
    pub cycle: u64,
}

impl LoopState {
    fn new() -> Self {
        Self {
            phase: Phase::Observe,
            mode: Mode::Solver,
            repair_attempts: 0,
            cycle: 0,
        }
    }

    fn advance_phase(&mut self) {
        self.phase = self.phase.next();
    }

    fn enter_verifier(&mut self) {
        self.mode = Mode::Verifier;
    }

    fn exit_verifier(&mut self) {
        self.mode = Mode::Solver;
        self.repair_attempts = 0;
    }
}

/// Cooperative cancellation flag, checked only at phase boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one inner-loop cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub agent_id: String,
    pub cycle: u64,
    pub surprise_score: f64,
    pub elevated: bool,
    pub observation: Option<EntryId>,
    pub plan_entry: Option<EntryId>,
    /// Context entries that informed the plan, in rank order.
    pub context: Vec<EntryId>,
    pub mode_after: Mode,
    pub repair: Option<RepairOutcome>,
    /// Set when cancellation was observed; names the boundary it stopped at.
    pub cancelled_at: Option<Phase>,
}

/// What one outer-loop consolidation did.
#[derive(Debug, Clone)]
pub struct ConsolidationReport {
    pub scope: String,
    pub sweep: SweepOutcome,
    pub patterns_registered: usize,
    pub references_pruned: usize,
}

// ---------------------------------------------------------------------------
// Scope locks
// ---------------------------------------------------------------------------

/// Per-scope async locks: no two outer-loop runs for the same scope overlap.
#[derive(Debug, Default)]
struct ScopeLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScopeLocks {
    async fn acquire(&self, scope: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The control core wiring store, surprise, utility, and compression into
/// the two loops.
pub struct DualLoopOrchestrator {
    store: Arc<StratumStore>,
    surprise: Arc<SurpriseEngine>,
    scorer: Arc<UtilityScorer>,
    compressor: MemoryCompressor,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    confidence_floor: f64,
    max_repair_attempts: u32,
    consolidation_trigger: usize,

    states: tokio::sync::Mutex<HashMap<String, LoopState>>,
    /// Historical accuracy EMA per (agent, action) key.
    accuracy: std::sync::Mutex<HashMap<String, f64>>,
    scopes: ScopeLocks,
}

impl DualLoopOrchestrator {
    pub fn new(
        config: &EngineConfig,
        store: Arc<StratumStore>,
        surprise: Arc<SurpriseEngine>,
        scorer: Arc<UtilityScorer>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            surprise,
            scorer,
            compressor: MemoryCompressor::from_config(config),
            bus,
            clock,
            confidence_floor: config.confidence_floor,
            max_repair_attempts: config.max_repair_attempts,
            consolidation_trigger: config.consolidation_trigger,
            states: tokio::sync::Mutex::new(HashMap::new()),
            accuracy: std::sync::Mutex::new(HashMap::new()),
            scopes: ScopeLocks::default(),
        }
    }

    /// Current loop state for an agent (Solver/Observe when never seen).
    pub async fn loop_state(&self, agent_id: &str) -> LoopState {
        let states = self.states.lock().await;
        states.get(agent_id).copied().unwrap_or_else(LoopState::new)
    }

    // -- confidence ---------------------------------------------------------

    /// Confidence in [0,1] for an Act outcome: success flag, retry count,
    /// and historical accuracy for the same action key.
    fn confidence(&self, agent_id: &str, action: &str, outcome: &ActionOutcome) -> f64 {
        let key = format!("{agent_id}/{action}");
        let mut accuracy = self.accuracy.lock().unwrap();
        let history = *accuracy.get(&key).unwrap_or(&0.5);

        let success_part = if outcome.success { 1.0 } else { 0.0 };
        let retry_part = 1.0 / (1.0 + f64::from(outcome.retry_count));
        let confidence = 0.5 * success_part + 0.3 * retry_part + 0.2 * history;

        accuracy.insert(key, 0.8 * history + 0.2 * success_part);
        confidence.clamp(0.0, 1.0)
    }

    // -- inner loop ---------------------------------------------------------

    /// Drive one full inner-loop cycle for the event's agent.
    ///
    /// Suspends only at store boundaries and the Act-phase tool call;
    /// cancellation is honored at phase boundaries, never mid-phase.
    pub async fn run_cycle(
        &self,
        event: CycleEvent,
        runner: &dyn ActionRunner,
        cancel: &CancelFlag,
    ) -> Result<CycleReport> {
        let cycle = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(event.agent_id.clone())
                .or_insert_with(LoopState::new);
            state.cycle += 1;
            state.phase = Phase::Observe;
            state.cycle
        };

        let mut report = CycleReport {
            agent_id: event.agent_id.clone(),
            cycle,
            surprise_score: 0.0,
            elevated: false,
            observation: None,
            plan_entry: None,
            context: Vec::new(),
            mode_after: self.loop_state(&event.agent_id).await.mode,
            repair: None,
            cancelled_at: None,
        };

        // Observe: score the outcome pair and encode the observation.
        let scored = self.surprise.score(
            &event.agent_id,
            &event.channel_id,
            &event.expected,
            &event.actual,
        );
        report.surprise_score = scored.score;
        report.elevated = scored.elevated;

        let observation_id = self.write_observation(&event, scored.elevated).await?;
        report.observation = Some(observation_id.clone());

        let record = self.surprise.make_record(
            &event.agent_id,
            &event.channel_id,
            scored,
            event.expected.clone(),
            event.actual.clone(),
            Some(observation_id),
        );
        self.store.record_surprise(&record).await?;
        self.bus.emit(EngineEvent::SurpriseRecorded {
            agent_id: event.agent_id.clone(),
            context_key: event.channel_id.clone(),
            score: scored.score,
            elevated: scored.elevated,
        });

        if self.phase_boundary(&event.agent_id, cancel, &mut report).await {
            return Ok(report);
        }

        // Reason: assemble ranked context from reasoning strata.
        let context = self.ranked_context(&event, Phase::Reason, 8).await?;
        if self.phase_boundary(&event.agent_id, cancel, &mut report).await {
            return Ok(report);
        }

        // Plan: re-rank under the planning lambda and record the plan.
        let planning_context = self.ranked_context(&event, Phase::Plan, 8).await?;
        let context_ids: Vec<EntryId> = planning_context.iter().map(|e| e.id.clone()).collect();
        report.context = context_ids.clone();

        let plan_text = format!(
            "address '{}' drawing on {} prior memories",
            event.description,
            context.len().max(planning_context.len())
        );
        let plan_id = self
            .store
            .store(
                EntryDraft::text(plan_text.clone(), 3, self.entry_source(&event, Phase::Plan))
                    .with_tag("plan")
                    .with_tags(event.tags.iter().cloned()),
            )
            .await?;
        report.plan_entry = Some(plan_id);

        if self.phase_boundary(&event.agent_id, cancel, &mut report).await {
            return Ok(report);
        }

        // Act: invoke the tool boundary and gate on confidence.
        let outcome = runner.run(&event.agent_id, &plan_text).await;
        let confidence = self.confidence(&event.agent_id, &event.description, &outcome);

        let acted_ok = outcome.success && confidence >= self.confidence_floor;
        if !acted_ok {
            let repair_outcome = self
                .verifier_pass(&event, runner, &outcome, confidence)
                .await?;
            report.repair = Some(repair_outcome);
        } else {
            // A verified action while still in Verifier mode counts as
            // re-verification success.
            let was_verifier = {
                let mut states = self.states.lock().await;
                let state = states
                    .entry(event.agent_id.clone())
                    .or_insert_with(LoopState::new);
                let was = state.mode == Mode::Verifier;
                if was {
                    state.exit_verifier();
                }
                was
            };
            if was_verifier {
                obs::emit_mode_changed(&event.agent_id, Mode::Solver);
                self.bus.emit(EngineEvent::ModeChanged {
                    agent_id: event.agent_id.clone(),
                    mode: Mode::Solver,
                });
            }
        }
        report.mode_after = self.loop_state(&event.agent_id).await.mode;

        if self.phase_boundary(&event.agent_id, cancel, &mut report).await {
            return Ok(report);
        }

        // Reflect: record the cycle's outcome and feed utility learning.
        let reflection = format!(
            "cycle {cycle}: action {} (confidence {confidence:.2}, surprise {:.2})",
            if acted_ok { "succeeded" } else { "was repaired" },
            report.surprise_score,
        );
        self.store
            .store(
                EntryDraft::text(reflection, 2, self.entry_source(&event, Phase::Reflect))
                    .with_tag("reflection"),
            )
            .await?;

        let reward = if acted_ok { 0.5 } else { -0.3 };
        for id in &context_ids {
            // Context entries may have been compressed away mid-cycle.
            if let Err(EngineError::UnknownEntry { .. }) = self.scorer.update(id, reward) {
                continue;
            }
        }

        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(&event.agent_id) {
                state.phase = Phase::Observe;
            }
        }
        Ok(report)
    }

    /// Advance the phase axis, honoring cancellation. Returns `true` when
    /// the cycle should stop here.
    async fn phase_boundary(
        &self,
        agent_id: &str,
        cancel: &CancelFlag,
        report: &mut CycleReport,
    ) -> bool {
        let mut states = self.states.lock().await;
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(LoopState::new);
        if cancel.is_cancelled() {
            report.cancelled_at = Some(state.phase);
            state.phase = Phase::Observe;
            return true;
        }
        state.advance_phase();
        false
    }

    fn entry_source(&self, event: &CycleEvent, phase: Phase) -> crate::domain::EntrySource {
        crate::domain::EntrySource::new(event.agent_id.clone(), event.channel_id.clone())
            .at_cycle(event.cycle)
            .in_phase(phase)
    }

    /// Encode an observation. Elevated surprise amplifies importance and
    /// lands directly in Episodic instead of Working.
    async fn write_observation(&self, event: &CycleEvent, elevated: bool) -> Result<EntryId> {
        let base_importance = 3u8;
        let mut draft = EntryDraft::text(
            event.description.clone(),
            if elevated {
                (base_importance + 1).min(5)
            } else {
                base_importance
            },
            self.entry_source(event, Phase::Observe),
        )
        .with_tag("observation")
        .with_tags(event.tags.iter().cloned());

        if elevated {
            draft = draft.with_tag("elevated").in_stratum(Stratum::Episodic);
        }
        self.store.store(draft).await
    }

    /// Phase-scoped retrieval ranked by the blended score, with similarity
    /// taken as tag overlap against the event's tags.
    async fn ranked_context(
        &self,
        event: &CycleEvent,
        phase: Phase,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>> {
        let mut candidates = Vec::new();
        for stratum in phase.read_strata() {
            candidates.extend(self.store.query(*stratum, &EntryFilter::any()).await?);
        }

        let mut ranked: Vec<(f64, MemoryEntry)> = candidates
            .into_iter()
            .map(|entry| {
                let similarity = tag_similarity(&event.tags, &entry.tags);
                let q = self.scorer.q(&entry.id).unwrap_or(entry.utility);
                (self.scorer.retrieval_score(q, similarity, phase), entry)
            })
            .collect();
        ranked.sort_by(|(a, ea), (b, eb)| {
            b.partial_cmp(a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ea.id.cmp(&eb.id))
        });
        ranked.truncate(limit);
        Ok(ranked.into_iter().map(|(_, e)| e).collect())
    }

    // -- verifier mode ------------------------------------------------------

    /// Run the Verifier sub-sequence for a failed or low-confidence action.
    ///
    /// On success the corrected reasoning becomes a LongTerm entry tagged
    /// `self-repair` and mode returns to Solver. On exhaustion the error is
    /// surfaced to the caller, never an unbounded retry.
    async fn verifier_pass(
        &self,
        event: &CycleEvent,
        runner: &dyn ActionRunner,
        outcome: &ActionOutcome,
        confidence: f64,
    ) -> Result<RepairOutcome> {
        {
            let mut states = self.states.lock().await;
            states
                .entry(event.agent_id.clone())
                .or_insert_with(LoopState::new)
                .enter_verifier();
        }
        obs::emit_mode_changed(&event.agent_id, Mode::Verifier);
        self.bus.emit(EngineEvent::ModeChanged {
            agent_id: event.agent_id.clone(),
            mode: Mode::Verifier,
        });

        let failure = ActFailure {
            action: event.description.clone(),
            message: if outcome.success {
                format!("confidence {confidence:.2} below floor")
            } else {
                outcome.detail.clone()
            },
            retry_count: outcome.retry_count,
            confidence,
        };

        let agent_id = event.agent_id.clone();
        let bus = self.bus.clone();
        let log = run_repair_loop(
            &agent_id,
            failure,
            self.max_repair_attempts,
            self.clock.now(),
            |attempt, patch| {
                let bus = bus.clone();
                let agent = agent_id.clone();
                async move {
                    let verified = runner.apply_patch(&agent, &patch).await;
                    METRICS.inc_patches_applied();
                    bus.emit(EngineEvent::PatchApplied {
                        agent_id: agent.clone(),
                        attempt,
                    });
                    if !verified {
                        let transient = EngineError::VerificationFailed {
                            attempt,
                            reason: patch.verification.clone(),
                        };
                        warn!(agent_id = %agent, error = %transient, "patch did not verify");
                    }
                    RepairAttemptResult {
                        verified,
                        next_failure: None,
                    }
                }
            },
        )
        .await;

        {
            let mut states = self.states.lock().await;
            let state = states
                .entry(event.agent_id.clone())
                .or_insert_with(LoopState::new);
            state.repair_attempts = log.attempts.len() as u32;
        }

        match log.outcome {
            RepairOutcome::Repaired => {
                self.store
                    .store(
                        EntryDraft::text(
                            log.corrected_reasoning(),
                            4,
                            self.entry_source(event, Phase::Act),
                        )
                        .with_tag("self-repair")
                        .in_stratum(Stratum::LongTerm),
                    )
                    .await?;

                {
                    let mut states = self.states.lock().await;
                    if let Some(state) = states.get_mut(&event.agent_id) {
                        state.exit_verifier();
                    }
                }
                obs::emit_mode_changed(&event.agent_id, Mode::Solver);
                self.bus.emit(EngineEvent::ModeChanged {
                    agent_id: event.agent_id.clone(),
                    mode: Mode::Solver,
                });
                Ok(RepairOutcome::Repaired)
            }
            RepairOutcome::Exhausted => {
                self.bus.emit(EngineEvent::SelfRepairExhausted {
                    agent_id: event.agent_id.clone(),
                    attempts: log.attempts.len() as u32,
                });
                Err(EngineError::SelfRepairExhausted {
                    agent_id: event.agent_id.clone(),
                    attempts: log.attempts.len() as u32,
                })
            }
        }
    }

    // -- outer loop ---------------------------------------------------------

    /// Whether episodic pressure has crossed the consolidation trigger.
    pub async fn should_consolidate(&self) -> bool {
        self.store.episodic_pressure().await >= self.consolidation_trigger
    }

    /// One outer-loop pass for a scope: detect patterns, promote, compress,
    /// link, analyze. Mutually exclusive per scope.
    pub async fn consolidate(&self, scope: &str) -> Result<ConsolidationReport> {
        let _guard = self.scopes.acquire(scope).await;
        info!(scope, "consolidation started");

        // Promote + compress; pattern detection happens inside compression.
        let report = self.store.sweep(Some(&self.compressor)).await?;

        let mut registered = 0usize;
        for pattern in &report.patterns {
            match self.store.record_pattern(pattern).await {
                Ok(()) => registered += 1,
                Err(e) => warn!(error = %e, "pattern not registered"),
            }
        }

        // Link: complete any pending purge cascades within this cycle.
        let pruned = self.store.prune_pattern_references().await?;

        // Analyze: flush counters at the pass boundary.
        METRICS.flush();
        self.store.reset_episodic_pressure().await;

        info!(
            scope,
            promoted = report.outcome.promoted.len(),
            demoted = report.outcome.demoted.len(),
            expired = report.outcome.expired.len(),
            patterns = registered,
            "consolidation finished"
        );
        Ok(ConsolidationReport {
            scope: scope.to_string(),
            sweep: report.outcome,
            patterns_registered: registered,
            references_pruned: pruned,
        })
    }

    /// Host the outer loop on a timer until cancelled. The returned task
    /// runs concurrently with any number of inner loops.
    pub fn spawn_outer_loop(
        self: Arc<Self>,
        scope: String,
        interval: std::time::Duration,
        cancel: CancelFlag,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = self.consolidate(&scope).await {
                    warn!(scope = %scope, error = %e, "consolidation pass failed");
                }
            }
        })
    }
}

fn tag_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
